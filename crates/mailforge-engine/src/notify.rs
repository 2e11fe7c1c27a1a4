//! Notifier - outbound messages to the campaign owner
//!
//! The engine never talks to the chat transport directly; the orchestration
//! layer injects a `Notifier` and relays the text. Notifications are
//! best-effort and must not fail the sending loop.

use async_trait::async_trait;
use mailforge_common::types::OwnerId;
use tracing::info;

/// Capability interface for user-facing notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: OwnerId, text: &str);
}

/// Notifier that discards everything
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _owner: OwnerId, _text: &str) {}
}

/// Notifier that writes to the log, used by the standalone worker
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner: OwnerId, text: &str) {
        info!(owner, message = text, "User notification");
    }
}
