//! Campaign Worker - One cooperative worker per user
//!
//! The worker acquires the user's advisory lock, loads the persisted
//! sending state, and drives the batch processor until the recipient list
//! is exhausted, the quota denies further sends, an external pause/cancel
//! is observed, or the credential pool is exhausted. Failing to get the
//! lock means another worker is already active and the invocation is a
//! silent no-op.

use chrono::Utc;
use mailforge_common::config::Config;
use mailforge_common::types::OwnerId;
use mailforge_common::{Error, Result};
use mailforge_store::models::CampaignStatus;
use mailforge_store::{SnapshotStore, UserLock};
use std::sync::Arc;
use tracing::{error, info};

use crate::credentials::CredentialPool;
use crate::notify::Notifier;
use crate::processor::{BatchOutcome, BatchProcessor};
use crate::quota::QuotaTracker;
use crate::registry::CampaignRegistry;
use crate::transport::MailTransport;

/// How a worker invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every recipient was processed
    Completed,
    /// Another worker holds the user's lock; nothing was done
    AlreadyRunning,
    /// The user has no resumable campaign
    NoCampaign,
    /// Quota denied further sends; the campaign stays running and resumes
    /// on a later invocation
    QuotaExhausted,
    /// An external pause or cancel was honored
    Interrupted(CampaignStatus),
    /// The campaign transitioned to failed
    Failed,
}

/// Drives one user's campaign to a stopping point
pub struct CampaignWorker {
    owner: OwnerId,
    config: Config,
    store: SnapshotStore,
    registry: Arc<CampaignRegistry>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn MailTransport>,
}

impl CampaignWorker {
    pub fn new(
        owner: OwnerId,
        config: Config,
        store: SnapshotStore,
        registry: Arc<CampaignRegistry>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            owner,
            config,
            store,
            registry,
            notifier,
            transport,
        }
    }

    /// Run until a stopping point. Per-recipient errors are handled inside
    /// the processor; everything user-visible goes through the notifier.
    pub async fn run(&self) -> Result<WorkerExit> {
        let Some(_lock) = UserLock::try_acquire(&self.config.storage.data_dir, self.owner)? else {
            info!(owner = self.owner, "Another worker is active for this user; exiting");
            return Ok(WorkerExit::AlreadyRunning);
        };

        let Some(record) = self.store.load_user(self.owner).await? else {
            info!(owner = self.owner, "No state for user; nothing to do");
            return Ok(WorkerExit::NoCampaign);
        };
        let Some(mut campaign) = record.sending_state.clone() else {
            info!(owner = self.owner, "No campaign for user; nothing to do");
            return Ok(WorkerExit::NoCampaign);
        };
        if campaign.status.is_terminal() {
            info!(
                owner = self.owner,
                campaign = %campaign.id,
                status = %campaign.status,
                "Campaign already finished; nothing to do"
            );
            return Ok(WorkerExit::NoCampaign);
        }

        let now = Utc::now();
        // A campaign persisted as running belongs to a worker that died
        // mid-flight; resume it as-is.
        if campaign.status != CampaignStatus::Running {
            campaign.start(now)?;
        }

        let tracker = QuotaTracker::new(
            record.quota.clone(),
            record.plan.clone(),
            self.config.quota.system_daily_cap,
        );
        let pool = CredentialPool::new(
            record.credentials.clone(),
            record.active_credential,
            &self.config.pool,
        )?;

        let mut processor = BatchProcessor::new(
            self.owner,
            campaign,
            tracker,
            pool,
            self.store.clone(),
            self.transport.clone(),
        );

        if processor.pool().is_empty() {
            return self
                .fail_campaign(&mut processor, "no sending credentials configured")
                .await;
        }

        // Durably mark the campaign running before the first batch
        let _ = processor.persist().await;
        self.registry.insert(processor.campaign().clone()).await;

        let total = processor.campaign().recipients.len();
        info!(
            owner = self.owner,
            campaign = %processor.campaign().id,
            remaining = processor.campaign().remaining(),
            total,
            "Worker started"
        );

        loop {
            let pool_before = processor.pool().len();
            let outcome = processor.process_batch().await;

            if processor.pool().len() < pool_before {
                let removed = pool_before - processor.pool().len();
                self.notifier
                    .notify(
                        self.owner,
                        &format!(
                            "Removed {} failing sending account(s) from rotation; {} left.",
                            removed,
                            processor.pool().len()
                        ),
                    )
                    .await;
            }
            if let Ok(outcome) = &outcome {
                let stats = outcome.stats();
                if stats.rotations > 0 {
                    self.notifier
                        .notify(
                            self.owner,
                            &format!(
                                "Switched sending account {} time(s) after delivery problems.",
                                stats.rotations
                            ),
                        )
                        .await;
                }
            }

            if let Some(warning) = processor.take_quota_warning() {
                self.notifier
                    .notify(
                        self.owner,
                        &format!(
                            "Approaching your {} sending limit: {}/{} used ({}%).",
                            warning.window,
                            warning.used,
                            warning.limit,
                            warning.percent()
                        ),
                    )
                    .await;
            }

            match outcome {
                Ok(BatchOutcome::Progressed(stats)) => {
                    let campaign = processor.campaign().clone();
                    info!(
                        owner = self.owner,
                        progress = campaign.progress_index,
                        total,
                        sent = stats.sent,
                        failed = stats.failed,
                        skipped = stats.skipped,
                        rotations = stats.rotations,
                        "Batch processed"
                    );
                    self.notifier
                        .notify(
                            self.owner,
                            &format!(
                                "Progress: {}/{} recipients processed ({} sent, {} failed, {} skipped).",
                                campaign.progress_index,
                                total,
                                campaign.sent_count,
                                campaign.error_count,
                                campaign.skipped_count
                            ),
                        )
                        .await;
                    self.registry.insert(campaign).await;
                }
                Ok(BatchOutcome::Exhausted(_stats)) => {
                    let now = Utc::now();
                    processor.campaign_mut().complete(now)?;
                    let _ = processor.persist().await;
                    let campaign = processor.campaign().clone();
                    info!(
                        owner = self.owner,
                        campaign = %campaign.id,
                        sent = campaign.sent_count,
                        failed = campaign.error_count,
                        skipped = campaign.skipped_count,
                        "Campaign completed"
                    );
                    self.notifier
                        .notify(
                            self.owner,
                            &format!(
                                "Campaign finished: {} sent, {} failed, {} skipped.",
                                campaign.sent_count, campaign.error_count, campaign.skipped_count
                            ),
                        )
                        .await;
                    self.registry.insert(campaign).await;
                    return Ok(WorkerExit::Completed);
                }
                Ok(BatchOutcome::QuotaDenied { reason, .. }) => {
                    self.registry.insert(processor.campaign().clone()).await;
                    self.notifier
                        .notify(
                            self.owner,
                            &format!(
                                "Sending halted: {}. The campaign stays queued and resumes on the next run.",
                                reason
                            ),
                        )
                        .await;
                    return Ok(WorkerExit::QuotaExhausted);
                }
                Ok(BatchOutcome::Interrupted { status, .. }) => {
                    self.registry.insert(processor.campaign().clone()).await;
                    info!(
                        owner = self.owner,
                        campaign = %processor.campaign().id,
                        status = %status,
                        "Worker stopped by external signal"
                    );
                    return Ok(WorkerExit::Interrupted(status));
                }
                Err(Error::PoolExhausted) => {
                    return self
                        .fail_campaign(
                            &mut processor,
                            "every sending account was removed or is out of capacity",
                        )
                        .await;
                }
                Err(e) => {
                    error!(owner = self.owner, error = %e, "Worker error");
                    return self.fail_campaign(&mut processor, &e.to_string()).await;
                }
            }
        }
    }

    async fn fail_campaign(
        &self,
        processor: &mut BatchProcessor,
        reason: &str,
    ) -> Result<WorkerExit> {
        let now = Utc::now();
        processor.campaign_mut().fail(now, reason)?;
        let _ = processor.persist().await;
        self.registry.insert(processor.campaign().clone()).await;
        self.notifier
            .notify(self.owner, &format!("Campaign failed: {}.", reason))
            .await;
        Ok(WorkerExit::Failed)
    }
}
