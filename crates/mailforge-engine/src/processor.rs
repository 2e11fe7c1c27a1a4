//! Batch Processor - One tick of work for a running campaign
//!
//! A tick re-checks the persisted status (cooperative cancellation point),
//! walks the next `batch_size` recipients strictly in order, consults the
//! quota tracker before every send, drives the credential pool, and
//! persists after every recipient. Progress is advanced only after a
//! completed attempt, so a crash mid-batch redelivers at most the
//! in-flight recipient.

use chrono::Utc;
use mailforge_common::types::{EmailAddress, OwnerId};
use mailforge_common::{Error, Result};
use mailforge_store::models::{Campaign, CampaignStatus};
use mailforge_store::SnapshotStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::credentials::CredentialPool;
use crate::quota::{QuotaTracker, QuotaWarning};
use crate::transport::MailTransport;

/// Classification of a failed send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    TlsCertificate,
    QuotaLimit,
    SpamBlocked,
    Other,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::TlsCertificate => write!(f, "tls/certificate"),
            FailureClass::QuotaLimit => write!(f, "quota/limit"),
            FailureClass::SpamBlocked => write!(f, "spam/blocked"),
            FailureClass::Other => write!(f, "other"),
        }
    }
}

/// Classify a transport error message by its text
pub fn classify_failure(message: &str) -> FailureClass {
    let m = message.to_ascii_lowercase();
    if ["tls", "certificate", "ssl", "handshake"]
        .iter()
        .any(|k| m.contains(k))
    {
        FailureClass::TlsCertificate
    } else if ["quota", "limit", "too many", "throttl", "4.7.0"]
        .iter()
        .any(|k| m.contains(k))
    {
        FailureClass::QuotaLimit
    } else if ["spam", "block", "blacklist", "denied", "rejected", "554"]
        .iter()
        .any(|k| m.contains(k))
    {
        FailureClass::SpamBlocked
    } else {
        FailureClass::Other
    }
}

/// Statistics for one processed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rotations: u64,
}

/// Result of one batch tick
#[derive(Debug)]
pub enum BatchOutcome {
    /// Batch finished; more recipients remain
    Progressed(BatchStats),
    /// The recipient list is exhausted
    Exhausted(BatchStats),
    /// A quota denial stopped the batch early; the campaign stays running
    /// and the caller decides whether to pause or wait
    QuotaDenied { stats: BatchStats, reason: String },
    /// An external pause/cancel was observed
    Interrupted {
        stats: BatchStats,
        status: CampaignStatus,
    },
}

impl BatchOutcome {
    /// Statistics accumulated before the batch stopped
    pub fn stats(&self) -> &BatchStats {
        match self {
            BatchOutcome::Progressed(stats)
            | BatchOutcome::Exhausted(stats)
            | BatchOutcome::QuotaDenied { stats, .. }
            | BatchOutcome::Interrupted { stats, .. } => stats,
        }
    }
}

/// Drives one campaign for one user
pub struct BatchProcessor {
    owner: OwnerId,
    campaign: Campaign,
    tracker: QuotaTracker,
    pool: CredentialPool,
    store: SnapshotStore,
    transport: Arc<dyn MailTransport>,
}

impl BatchProcessor {
    pub fn new(
        owner: OwnerId,
        campaign: Campaign,
        tracker: QuotaTracker,
        pool: CredentialPool,
        store: SnapshotStore,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            owner,
            campaign,
            tracker,
            pool,
            store,
            transport,
        }
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn campaign_mut(&mut self) -> &mut Campaign {
        &mut self.campaign
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Pending approaching-limit warning, if one fired during the batch
    pub fn take_quota_warning(&mut self) -> Option<QuotaWarning> {
        self.tracker.take_warning()
    }

    /// Process one batch of recipients.
    ///
    /// Per-recipient failures are recovered locally; only pool exhaustion
    /// propagates as an error (the campaign-level failure).
    pub async fn process_batch(&mut self) -> Result<BatchOutcome> {
        let mut stats = BatchStats::default();

        // Cooperative cancellation point: honor an external pause/stop
        // before starting the batch, never mid-send.
        if let Some(status) = self.external_interrupt().await {
            self.campaign.status = status;
            return Ok(BatchOutcome::Interrupted { stats, status });
        }
        if self.campaign.status != CampaignStatus::Running {
            return Ok(BatchOutcome::Interrupted {
                stats,
                status: self.campaign.status,
            });
        }
        if self.campaign.is_exhausted() {
            return Ok(BatchOutcome::Exhausted(stats));
        }

        let end = (self.campaign.progress_index + self.campaign.options.batch_size)
            .min(self.campaign.recipients.len());

        while self.campaign.progress_index < end {
            let recipient = self.campaign.recipients[self.campaign.progress_index].clone();

            // Invalid addresses are skipped without consuming quota or
            // attempting a send; they are not failures.
            if !EmailAddress::is_valid(&recipient) {
                debug!(recipient = %recipient, "Skipping invalid recipient address");
                stats.skipped += 1;
                self.campaign.skipped_count += 1;
                if let Some(status) = self.advance_and_persist().await {
                    return Ok(BatchOutcome::Interrupted { stats, status });
                }
                continue;
            }

            let now = Utc::now();
            let decision = self.tracker.can_send(1, now);
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "quota exceeded".to_string());
                info!(owner = self.owner, reason = %reason, "Batch stopped by quota");
                let _ = self.persist().await;
                return Ok(BatchOutcome::QuotaDenied { stats, reason });
            }

            if !self.pool.can_attempt(now) {
                return Err(Error::PoolExhausted);
            }
            // Make sure the active credential is usable before the attempt;
            // a cooled-down account keeps its place only if it is the sole
            // survivor.
            if self
                .pool
                .current()
                .is_some_and(|c| c.in_cooldown(now) || !c.has_capacity(now))
            {
                let before = self.pool.active_index();
                self.pool.rotate("active credential unavailable", now)?;
                if self.pool.active_index() != before {
                    stats.rotations += 1;
                }
            }
            let credential = self.pool.current().cloned().ok_or(Error::PoolExhausted)?;

            let started = Instant::now();
            let result = self
                .transport
                .send(
                    &recipient,
                    &self.campaign.subject,
                    &self.campaign.template_body,
                    &credential,
                )
                .await;
            let latency = started.elapsed();
            let now = Utc::now();

            match result {
                Ok(()) => {
                    self.tracker.record_sent(1);
                    self.pool.record_outcome(true, latency, now);
                    self.campaign.sent_count += 1;
                    stats.sent += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    let class = classify_failure(&message);
                    warn!(
                        recipient = %recipient,
                        credential = %credential.label(),
                        class = %class,
                        error = %message,
                        "Send failed"
                    );

                    let rotated = self.pool.record_outcome(false, latency, now);
                    if rotated {
                        stats.rotations += 1;
                    } else {
                        // Class-specific escalation on top of the plain
                        // failure bookkeeping.
                        match class {
                            FailureClass::QuotaLimit => {
                                self.pool.apply_cooldown("provider limit response", now);
                                let before = self.pool.active_index();
                                if self.pool.rotate("provider limit response", now).is_ok()
                                    && self.pool.active_index() != before
                                {
                                    stats.rotations += 1;
                                }
                            }
                            FailureClass::SpamBlocked => {
                                if self.pool.flag_suspicious(2, now) {
                                    stats.rotations += 1;
                                }
                            }
                            FailureClass::TlsCertificate => {
                                if self.pool.flag_suspicious(1, now) {
                                    stats.rotations += 1;
                                }
                            }
                            FailureClass::Other => {}
                        }
                    }

                    stats.failed += 1;
                    self.campaign.error_count += 1;
                    self.campaign.last_error = Some(message);
                }
            }
            // Durability point: advance the cursor and persist before the
            // next recipient.
            if let Some(status) = self.advance_and_persist().await {
                return Ok(BatchOutcome::Interrupted { stats, status });
            }

            if self.campaign.progress_index < end && self.campaign.options.email_delay_ms > 0 {
                sleep(Duration::from_millis(self.campaign.options.email_delay_ms)).await;
            }
        }

        if self.campaign.is_exhausted() {
            return Ok(BatchOutcome::Exhausted(stats));
        }

        if self.campaign.options.batch_delay_ms > 0 {
            sleep(Duration::from_millis(self.campaign.options.batch_delay_ms)).await;
        }

        Ok(BatchOutcome::Progressed(stats))
    }

    // Re-read the persisted status; an out-of-band pause/cancel wins over
    // our in-memory `running`.
    async fn external_interrupt(&mut self) -> Option<CampaignStatus> {
        if self.campaign.status != CampaignStatus::Running {
            return None;
        }
        let record = self.store.load_user(self.owner).await.ok().flatten()?;
        let persisted = record.sending_state?;
        if persisted.id == self.campaign.id
            && matches!(
                persisted.status,
                CampaignStatus::Paused | CampaignStatus::Cancelled
            )
        {
            info!(
                owner = self.owner,
                campaign = %self.campaign.id,
                status = %persisted.status,
                "Observed external stop signal"
            );
            if persisted.status == CampaignStatus::Cancelled {
                self.campaign.ended_at = persisted.ended_at;
            }
            Some(persisted.status)
        } else {
            None
        }
    }

    async fn advance_and_persist(&mut self) -> Option<CampaignStatus> {
        self.campaign.progress_index += 1;
        self.persist().await
    }

    /// Persist quota, credential and campaign state in one read-modify-write
    /// cycle. An out-of-band pause/cancel flag found on disk is adopted
    /// instead of overwritten, which is what bounds stop latency to one
    /// in-flight recipient. Persistence failures are logged and retried at
    /// the next progress point.
    pub async fn persist(&mut self) -> Option<CampaignStatus> {
        let mut snapshot = match self.store.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(owner = self.owner, error = %e, "Failed to load snapshot; progress not persisted");
                return None;
            }
        };
        let record = snapshot.users.entry(self.owner).or_default();

        let mut external = None;
        if let Some(persisted) = &record.sending_state {
            if persisted.id == self.campaign.id
                && self.campaign.status == CampaignStatus::Running
                && matches!(
                    persisted.status,
                    CampaignStatus::Paused | CampaignStatus::Cancelled
                )
            {
                self.campaign.status = persisted.status;
                if persisted.status == CampaignStatus::Cancelled {
                    self.campaign.ended_at = persisted.ended_at.or_else(|| Some(Utc::now()));
                }
                external = Some(persisted.status);
            }
        }

        record.quota = self.tracker.record().clone();
        record.credentials = self.pool.credentials().to_vec();
        record.active_credential = self.pool.active_index();
        record.sending_state = Some(self.campaign.clone());

        if let Err(e) = self.store.save(&snapshot).await {
            warn!(owner = self.owner, error = %e, "Failed to persist progress; retrying at next progress point");
        }
        external
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailforge_common::config::PoolConfig;
    use mailforge_store::models::{CampaignOptions, Credential, PlanLimits, QuotaRecord};
    use mailforge_common::types::UNLIMITED;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Transport whose outcomes are scripted per call; records recipients
    pub(crate) struct ScriptedTransport {
        outcomes: Mutex<VecDeque<std::result::Result<(), String>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn all_ok() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn scripted(outcomes: Vec<std::result::Result<(), String>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn recipients(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(
            &self,
            recipient: &str,
            _subject: &str,
            _body: &str,
            _credential: &Credential,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(recipient.to_string());
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Err(message)) => Err(Error::Transport(message)),
                _ => Ok(()),
            }
        }
    }

    fn fast_options(batch_size: usize) -> CampaignOptions {
        CampaignOptions {
            batch_size,
            email_delay_ms: 0,
            batch_delay_ms: 0,
        }
    }

    fn running_campaign(recipients: Vec<&str>, batch_size: usize) -> Campaign {
        let mut campaign = Campaign::new(
            1,
            recipients.into_iter().map(String::from).collect(),
            "subject",
            "body",
            fast_options(batch_size),
            Utc::now(),
        );
        campaign.start(Utc::now()).unwrap();
        campaign
    }

    async fn store_with_campaign(dir: &TempDir, campaign: &Campaign) -> SnapshotStore {
        let store = SnapshotStore::new(dir.path()).unwrap();
        let campaign = campaign.clone();
        let creds = Credential::parse_list("smtp.a.com:465,u1,p1,a@a.com,A\nsmtp.b.com:465,u2,p2,b@b.com,B").unwrap();
        store
            .update_user(campaign.owner_id, move |record| {
                record.credentials = creds;
                record.sending_state = Some(campaign);
            })
            .await
            .unwrap();
        store
    }

    fn processor_for(
        campaign: Campaign,
        store: SnapshotStore,
        transport: Arc<dyn MailTransport>,
        hourly_limit: i64,
    ) -> BatchProcessor {
        let plan = PlanLimits {
            hourly_limit,
            daily_limit: UNLIMITED,
            expires_at: None,
        };
        let tracker = QuotaTracker::new(QuotaRecord::default(), plan, 0);
        let creds = Credential::parse_list("smtp.a.com:465,u1,p1,a@a.com,A\nsmtp.b.com:465,u2,p2,b@b.com,B").unwrap();
        let pool = CredentialPool::new(creds, 0, &PoolConfig::default()).unwrap();
        BatchProcessor::new(campaign.owner_id, campaign, tracker, pool, store, transport)
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("TLS handshake failed: bad certificate"),
            FailureClass::TlsCertificate
        );
        assert_eq!(
            classify_failure("454 4.7.0 Too many login attempts"),
            FailureClass::QuotaLimit
        );
        assert_eq!(
            classify_failure("Daily sending quota exceeded"),
            FailureClass::QuotaLimit
        );
        assert_eq!(
            classify_failure("554 Message rejected as spam"),
            FailureClass::SpamBlocked
        );
        assert_eq!(
            classify_failure("connection reset by peer"),
            FailureClass::Other
        );
    }

    #[tokio::test]
    async fn test_invalid_recipient_skipped_without_quota() {
        let campaign =
            running_campaign(vec!["a@x.com", "not-an-email", "b@x.com", "c@x.com"], 2);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::all_ok());
        let mut processor = processor_for(campaign, store.clone(), transport.clone(), UNLIMITED);

        // Batch 1 covers [a@x.com, not-an-email]
        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::Progressed(stats) => {
                assert_eq!(stats.sent, 1);
                assert_eq!(stats.skipped, 1);
                assert_eq!(stats.failed, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(processor.campaign().progress_index, 2);

        // Batch 2 covers [b@x.com, c@x.com] and exhausts the list
        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::Exhausted(stats) => assert_eq!(stats.sent, 2),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let campaign = processor.campaign();
        assert_eq!(campaign.progress_index, 4);
        assert_eq!(
            campaign.sent_count + campaign.error_count + campaign.skipped_count,
            4
        );
        // The skipped entry consumed no quota and produced no send attempt
        assert_eq!(processor.tracker.record().sent_hour, 3);
        assert_eq!(
            transport.recipients(),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
    }

    #[tokio::test]
    async fn test_quota_denial_stops_batch_early() {
        let campaign = running_campaign(vec!["a@x.com", "b@x.com", "c@x.com"], 3);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::all_ok());
        let mut processor = processor_for(campaign, store.clone(), transport.clone(), 2);

        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::QuotaDenied { stats, reason } => {
                assert_eq!(stats.sent, 2);
                assert!(reason.contains("hourly"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The campaign remains running at the denial point
        let campaign = processor.campaign();
        assert_eq!(campaign.status, CampaignStatus::Running);
        assert_eq!(campaign.progress_index, 2);
        assert_eq!(campaign.sent_count, 2);

        // And the denial point is durable
        let record = store.load_user(1).await.unwrap().unwrap();
        assert_eq!(record.sending_state.unwrap().progress_index, 2);
        assert_eq!(record.quota.sent_hour, 2);
    }

    #[tokio::test]
    async fn test_progress_persisted_per_recipient() {
        let campaign = running_campaign(vec!["a@x.com", "b@x.com"], 10);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::all_ok());
        let mut processor = processor_for(campaign, store.clone(), transport, UNLIMITED);

        processor.process_batch().await.unwrap();

        let record = store.load_user(1).await.unwrap().unwrap();
        let persisted = record.sending_state.unwrap();
        assert_eq!(persisted.progress_index, 2);
        assert_eq!(persisted.sent_count, 2);
        assert_eq!(record.quota.sent_hour, 2);
        // Credential health state is persisted alongside
        assert_eq!(record.credentials[0].delivery_successes, 2);
    }

    #[tokio::test]
    async fn test_external_pause_observed_at_batch_top() {
        let campaign = running_campaign(vec!["a@x.com", "b@x.com"], 2);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;

        // Out-of-band pause: flip the persisted flag
        store
            .update_user(1, |record| {
                record.sending_state.as_mut().unwrap().status = CampaignStatus::Paused;
            })
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::all_ok());
        let mut processor = processor_for(campaign, store, transport.clone(), UNLIMITED);

        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::Interrupted { status, stats } => {
                assert_eq!(status, CampaignStatus::Paused);
                assert_eq!(stats.sent, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // Nothing was sent after the signal
        assert!(transport.recipients().is_empty());
        assert_eq!(processor.campaign().status, CampaignStatus::Paused);
    }

    #[tokio::test]
    async fn test_failures_are_recovered_locally() {
        let campaign = running_campaign(vec!["a@x.com", "b@x.com", "c@x.com"], 3);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::scripted(vec![
            Ok(()),
            Err("connection reset by peer".to_string()),
            Ok(()),
        ]));
        let mut processor = processor_for(campaign, store, transport, UNLIMITED);

        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::Exhausted(stats) => {
                assert_eq!(stats.sent, 2);
                assert_eq!(stats.failed, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let campaign = processor.campaign();
        assert_eq!(campaign.sent_count, 2);
        assert_eq!(campaign.error_count, 1);
        assert_eq!(campaign.progress_index, 3);
        assert!(campaign.last_error.as_deref().unwrap().contains("reset"));
        // Failed sends never consume quota
        assert_eq!(processor.tracker.record().sent_hour, 2);
    }

    #[tokio::test]
    async fn test_empty_pool_escalates() {
        let campaign = running_campaign(vec!["a@x.com"], 1);
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::all_ok());

        let plan = PlanLimits {
            hourly_limit: UNLIMITED,
            daily_limit: UNLIMITED,
            expires_at: None,
        };
        let tracker = QuotaTracker::new(QuotaRecord::default(), plan, 0);
        let pool = CredentialPool::new(Vec::new(), 0, &PoolConfig::default()).unwrap();
        let mut processor = BatchProcessor::new(1, campaign, tracker, pool, store, transport);

        let err = processor.process_batch().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }

    #[tokio::test]
    async fn test_repeated_failures_rotate_pool() {
        let campaign = running_campaign(
            vec!["a@x.com", "b@x.com", "c@x.com", "d@x.com"],
            4,
        );
        let dir = TempDir::new().unwrap();
        let store = store_with_campaign(&dir, &campaign).await;
        let transport = Arc::new(ScriptedTransport::scripted(vec![
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Ok(()),
        ]));
        let mut processor = processor_for(campaign, store, transport, UNLIMITED);

        let outcome = processor.process_batch().await.unwrap();
        match outcome {
            BatchOutcome::Exhausted(stats) => {
                assert_eq!(stats.failed, 3);
                assert_eq!(stats.sent, 1);
                // Third consecutive failure tripped exactly one rotation
                assert_eq!(stats.rotations, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // The fourth send went out on the rotated-to credential
        assert_eq!(processor.pool().active_index(), 1);
    }
}
