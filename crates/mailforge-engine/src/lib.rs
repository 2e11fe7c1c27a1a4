//! Mailforge Engine - Campaign sending core
//!
//! This crate drives bulk-send campaigns: per-user quota enforcement,
//! credential rotation with health tracking, the campaign lifecycle, and
//! the resumable batch processor that ties them together. The chat-facing
//! orchestration layer talks to [`CampaignEngine`] and receives progress
//! through the [`Notifier`] trait; mail transport is behind
//! [`MailTransport`].

pub mod credentials;
pub mod notify;
pub mod processor;
pub mod quota;
pub mod registry;
pub mod service;
pub mod transport;
pub mod worker;

pub use credentials::{CredentialPool, RotationStrategy};
pub use notify::{LogNotifier, NoopNotifier, Notifier};
pub use processor::{BatchOutcome, BatchProcessor, BatchStats, FailureClass};
pub use quota::{QuotaDecision, QuotaTracker, QuotaWarning, QuotaWindow, RemainingQuota};
pub use registry::CampaignRegistry;
pub use service::{CampaignEngine, CampaignSnapshot};
pub use transport::{MailTransport, SmtpSender};
pub use worker::{CampaignWorker, WorkerExit};
