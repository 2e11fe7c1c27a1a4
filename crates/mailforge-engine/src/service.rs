//! Campaign Engine - Facade consumed by the orchestration layer
//!
//! Owns the store, the registry and the injected collaborators, and exposes
//! campaign lifecycle operations plus the per-user worker entry point. All
//! lifecycle transitions are persisted before returning to the caller.

use chrono::{DateTime, Utc};
use mailforge_common::config::Config;
use mailforge_common::types::{CampaignId, EmailAddress, OwnerId};
use mailforge_common::{Error, Result};
use mailforge_store::models::{
    Campaign, CampaignOptions, CampaignStatus, Credential, PlanLimits,
};
use mailforge_store::SnapshotStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::notify::Notifier;
use crate::quota::{remaining_quota, QuotaTracker};
use crate::registry::CampaignRegistry;
use crate::transport::MailTransport;
use crate::worker::{CampaignWorker, WorkerExit};

/// Point-in-time view of a user's campaign for status display
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSnapshot {
    pub id: CampaignId,
    pub status: CampaignStatus,
    pub total_recipients: usize,
    pub progress_index: usize,
    pub sent_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Remaining quota in the current hourly window
    pub quota_remaining_hour: i64,
    /// Remaining quota in the current daily window
    pub quota_remaining_day: i64,
}

/// The campaign sending engine
pub struct CampaignEngine {
    config: Config,
    store: SnapshotStore,
    registry: Arc<CampaignRegistry>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn MailTransport>,
}

impl CampaignEngine {
    /// Build the engine over its injected collaborators
    pub fn new(
        config: Config,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self> {
        let store = SnapshotStore::new(&config.storage.data_dir)?;
        Ok(Self {
            config,
            store,
            registry: Arc::new(CampaignRegistry::new()),
            notifier,
            transport,
        })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn registry(&self) -> Arc<CampaignRegistry> {
        Arc::clone(&self.registry)
    }

    /// Replace the user's credential list from its newline-delimited text
    /// form. Returns the number of accounts configured.
    pub async fn set_credentials(&self, owner: OwnerId, input: &str) -> Result<usize> {
        let credentials = Credential::parse_list(input)?;
        if credentials.is_empty() {
            return Err(Error::Validation("Credential list is empty".to_string()));
        }
        let count = credentials.len();
        self.store
            .update_user(owner, move |record| {
                record.credentials = credentials;
                record.active_credential = 0;
            })
            .await?;
        info!(owner, count, "Configured credentials");
        Ok(count)
    }

    /// Set the user's plan limits
    pub async fn set_plan(&self, owner: OwnerId, plan_id: &str, limits: PlanLimits) -> Result<()> {
        let plan_id = plan_id.to_string();
        self.store
            .update_user(owner, move |record| {
                record.quota.plan_id = plan_id;
                record.plan = limits;
            })
            .await?;
        Ok(())
    }

    /// Create a campaign for the owner. Rejected while the owner already has
    /// a campaign in `running` state; a paused or finished campaign is
    /// replaced.
    pub async fn start_campaign(
        &self,
        owner: OwnerId,
        recipients: Vec<String>,
        subject: &str,
        template_body: &str,
        options: Option<CampaignOptions>,
    ) -> Result<CampaignId> {
        if subject.trim().is_empty() {
            return Err(Error::Validation("Subject is empty".to_string()));
        }
        if template_body.trim().is_empty() {
            return Err(Error::Validation("Template body is empty".to_string()));
        }

        let mut snapshot = self.store.load().await?;
        let record = snapshot.users.entry(owner).or_default();

        if record.credentials.is_empty() {
            return Err(Error::Credential(
                "No sending credentials configured".to_string(),
            ));
        }
        if let Some(existing) = &record.sending_state {
            if existing.status == CampaignStatus::Running {
                return Err(Error::State(format!(
                    "campaign {} is already running",
                    existing.id
                )));
            }
        }

        let now = Utc::now();
        let campaign = Campaign::new(
            owner,
            recipients,
            subject,
            template_body,
            options.unwrap_or_else(|| CampaignOptions::from_config(&self.config.sending)),
            now,
        );
        if campaign.recipients.is_empty() {
            return Err(Error::Validation("Recipient list is empty".to_string()));
        }
        if !campaign.recipients.iter().any(|r| EmailAddress::is_valid(r)) {
            return Err(Error::Validation(
                "Recipient list contains no valid addresses".to_string(),
            ));
        }

        let id = campaign.id.clone();
        let recipient_count = campaign.recipients.len();
        record.sending_state = Some(campaign.clone());
        self.store.save(&snapshot).await?;
        self.registry.insert(campaign).await;

        info!(owner, campaign = %id, recipients = recipient_count, "Campaign created");
        Ok(id)
    }

    /// running -> paused, persisted before returning
    pub async fn pause_campaign(&self, owner: OwnerId) -> Result<()> {
        self.transition(owner, |campaign, _now| campaign.pause())
            .await?;
        info!(owner, "Campaign paused");
        Ok(())
    }

    /// paused -> running, persisted before returning. The campaign is
    /// actually driven by the next worker invocation.
    pub async fn resume_campaign(&self, owner: OwnerId) -> Result<()> {
        self.transition(owner, |campaign, now| campaign.start(now))
            .await?;
        info!(owner, "Campaign resumed");
        Ok(())
    }

    /// any non-terminal -> cancelled, persisted before returning
    pub async fn cancel_campaign(&self, owner: OwnerId) -> Result<()> {
        self.transition(owner, |campaign, now| campaign.cancel(now))
            .await?;
        self.notifier
            .notify(owner, "Campaign cancelled.")
            .await;
        info!(owner, "Campaign cancelled");
        Ok(())
    }

    async fn transition<F>(&self, owner: OwnerId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Campaign, DateTime<Utc>) -> Result<()> + Send,
    {
        let now = Utc::now();
        let campaign = self
            .store
            .update_user(owner, move |record| {
                let Some(campaign) = record.sending_state.as_mut() else {
                    return Err(Error::NotFound(format!(
                        "no campaign for user {}",
                        owner
                    )));
                };
                apply(campaign, now)?;
                Ok(campaign.clone())
            })
            .await??;
        self.registry.insert(campaign).await;
        Ok(())
    }

    /// Current campaign snapshot for status display.
    ///
    /// Rolls stale window anchors forward (without touching counters, which
    /// only reset on the active sending path) and persists them; this is
    /// the out-of-band status write discussed in the persistence notes.
    pub async fn get_status(&self, owner: OwnerId) -> Result<Option<CampaignSnapshot>> {
        let now = Utc::now();
        let system_daily_cap = self.config.quota.system_daily_cap;
        let snapshot = self
            .store
            .update_user(owner, move |record| {
                let mut tracker =
                    QuotaTracker::new(record.quota.clone(), record.plan.clone(), system_daily_cap);
                tracker.refresh_windows(now, false);
                record.quota = tracker.into_record();

                let campaign = record.sending_state.as_ref()?;
                let remaining =
                    remaining_quota(&record.quota, &record.plan, system_daily_cap, now);
                Some(CampaignSnapshot {
                    id: campaign.id.clone(),
                    status: campaign.status,
                    total_recipients: campaign.recipients.len(),
                    progress_index: campaign.progress_index,
                    sent_count: campaign.sent_count,
                    error_count: campaign.error_count,
                    skipped_count: campaign.skipped_count,
                    progress_percentage: campaign.progress_percentage(),
                    created_at: campaign.created_at,
                    started_at: campaign.started_at,
                    ended_at: campaign.ended_at,
                    last_error: campaign.last_error.clone(),
                    quota_remaining_hour: remaining.per_hour,
                    quota_remaining_day: remaining.per_day,
                })
            })
            .await?;
        Ok(snapshot)
    }

    /// Run one worker pass for the user. Returns `AlreadyRunning` without
    /// touching state when another worker holds the user's lock.
    pub async fn run_worker(&self, owner: OwnerId) -> Result<WorkerExit> {
        CampaignWorker::new(
            owner,
            self.config.clone(),
            self.store.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.notifier),
            Arc::clone(&self.transport),
        )
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use async_trait::async_trait;
    use mailforge_common::types::UNLIMITED;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct AlwaysOkTransport;

    #[async_trait]
    impl MailTransport for AlwaysOkTransport {
        async fn send(
            &self,
            _recipient: &str,
            _subject: &str,
            _body: &str,
            _credential: &Credential,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn engine(dir: &TempDir) -> CampaignEngine {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.sending.email_delay_ms = 0;
        config.sending.batch_delay_ms = 0;
        CampaignEngine::new(config, Arc::new(NoopNotifier), Arc::new(AlwaysOkTransport)).unwrap()
    }

    async fn configured_engine(dir: &TempDir) -> CampaignEngine {
        let engine = engine(dir);
        engine
            .set_credentials(1, "smtp.a.com:465,u,p,a@a.com,A")
            .await
            .unwrap();
        engine
            .set_plan(
                1,
                "pro",
                PlanLimits {
                    hourly_limit: UNLIMITED,
                    daily_limit: UNLIMITED,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_start_requires_credentials() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let err = engine
            .start_campaign(1, vec!["a@x.com".into()], "s", "b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let dir = TempDir::new().unwrap();
        let engine = configured_engine(&dir).await;

        assert!(matches!(
            engine.start_campaign(1, vec!["a@x.com".into()], "", "b", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.start_campaign(1, vec!["a@x.com".into()], "s", " ", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.start_campaign(1, vec![], "s", "b", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine
                .start_campaign(1, vec!["not-an-email".into()], "s", "b", None)
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_one_running_campaign_per_owner() {
        let dir = TempDir::new().unwrap();
        let engine = configured_engine(&dir).await;

        let id = engine
            .start_campaign(1, vec!["a@x.com".into()], "s", "b", None)
            .await
            .unwrap();

        // Mark it running, as a worker would
        engine
            .store()
            .update_user(1, |record| {
                record
                    .sending_state
                    .as_mut()
                    .unwrap()
                    .start(Utc::now())
                    .unwrap();
            })
            .await
            .unwrap();

        let err = engine
            .start_campaign(1, vec!["b@x.com".into()], "s", "b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert!(err.to_string().contains(&id));

        // A different owner is unaffected
        engine
            .set_credentials(2, "smtp.a.com:465,u,p,a@a.com,A")
            .await
            .unwrap();
        engine
            .start_campaign(2, vec!["c@x.com".into()], "s", "b", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_persist() {
        let dir = TempDir::new().unwrap();
        let engine = configured_engine(&dir).await;

        engine
            .start_campaign(1, vec!["a@x.com".into(), "b@x.com".into()], "s", "b", None)
            .await
            .unwrap();

        // pending -> pause is an invalid transition
        assert!(matches!(
            engine.pause_campaign(1).await,
            Err(Error::State(_))
        ));

        engine
            .store()
            .update_user(1, |record| {
                record
                    .sending_state
                    .as_mut()
                    .unwrap()
                    .start(Utc::now())
                    .unwrap();
            })
            .await
            .unwrap();

        engine.pause_campaign(1).await.unwrap();
        let status = engine.get_status(1).await.unwrap().unwrap();
        assert_eq!(status.status, CampaignStatus::Paused);

        engine.resume_campaign(1).await.unwrap();
        let status = engine.get_status(1).await.unwrap().unwrap();
        assert_eq!(status.status, CampaignStatus::Running);

        engine.cancel_campaign(1).await.unwrap();
        let status = engine.get_status(1).await.unwrap().unwrap();
        assert_eq!(status.status, CampaignStatus::Cancelled);
        assert!(status.ended_at.is_some());

        // Terminal: cancel again fails
        assert!(matches!(
            engine.cancel_campaign(1).await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_worker_run() {
        let dir = TempDir::new().unwrap();
        let engine = configured_engine(&dir).await;

        engine
            .start_campaign(
                1,
                vec!["a@x.com".into(), "not-an-email".into(), "b@x.com".into()],
                "s",
                "b",
                None,
            )
            .await
            .unwrap();

        let exit = engine.run_worker(1).await.unwrap();
        assert_eq!(exit, WorkerExit::Completed);

        let status = engine.get_status(1).await.unwrap().unwrap();
        assert_eq!(status.status, CampaignStatus::Completed);
        assert_eq!(status.sent_count, 2);
        assert_eq!(status.skipped_count, 1);
        assert_eq!(status.progress_index, 3);
        assert_eq!(status.progress_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_get_status_reports_quota_remaining() {
        let dir = TempDir::new().unwrap();
        let engine = configured_engine(&dir).await;
        engine
            .set_plan(
                1,
                "basic",
                PlanLimits {
                    hourly_limit: 10,
                    daily_limit: 100,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        engine
            .start_campaign(1, vec!["a@x.com".into(), "b@x.com".into()], "s", "b", None)
            .await
            .unwrap();
        engine.run_worker(1).await.unwrap();

        let status = engine.get_status(1).await.unwrap().unwrap();
        assert_eq!(status.quota_remaining_hour, 8);
        assert_eq!(status.quota_remaining_day, 98);
    }

    #[tokio::test]
    async fn test_get_status_without_campaign() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(engine.get_status(1).await.unwrap().is_none());
    }
}
