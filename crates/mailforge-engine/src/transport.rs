//! Mail Transport - the opaque send primitive
//!
//! The engine treats a send as `send(recipient, subject, body, credential)
//! -> success | failure`; everything below that line (MIME, SMTP dialogue)
//! lives behind this trait. `SmtpSender` is the production implementation.

use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials as SmtpCredentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailforge_common::{Error, Result};
use mailforge_store::models::{Credential, Encryption};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Opaque send primitive
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        credential: &Credential,
    ) -> Result<()>;
}

/// SMTP transport backed by lettre, one connection per send
pub struct SmtpSender {
    timeout: Duration,
}

impl SmtpSender {
    /// Create a sender with the given per-send deadline
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MailTransport for SmtpSender {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        credential: &Credential,
    ) -> Result<()> {
        let from: Mailbox = if credential.from_name.is_empty() {
            credential.from_address.parse()
        } else {
            format!("{} <{}>", credential.from_name, credential.from_address).parse()
        }
        .map_err(|e| Error::Credential(format!("Invalid from address: {}", e)))?;

        let to: Mailbox = recipient
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid recipient address: {}", e)))?;

        let msg_id = format!(
            "<{}.{}@{}>",
            Uuid::new_v4(),
            Utc::now().timestamp(),
            credential.host
        );

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .message_id(Some(msg_id))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| Error::Transport(format!("Failed to build message: {}", e)))?;

        let builder = match credential.encryption {
            Encryption::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&credential.host)
                .map_err(|e| Error::Transport(format!("Failed to create SMTP transport: {}", e)))?,
            Encryption::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&credential.host).map_err(
                    |e| Error::Transport(format!("Failed to create SMTP transport: {}", e)),
                )?
            }
            Encryption::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&credential.host)
            }
        };

        let mailer = builder
            .port(credential.port)
            .credentials(SmtpCredentials::new(
                credential.username.clone(),
                credential.secret.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        let response = mailer
            .send(email)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        debug!(recipient, response = ?response, "Email accepted by relay");

        Ok(())
    }
}
