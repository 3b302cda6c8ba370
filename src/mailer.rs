use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Confirmation,
    Cancellation,
}

/// An outbound message to a reservation holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub to: String,
    pub kind: MessageKind,
    pub subject: String,
    pub html: String,
}

impl Message {
    pub fn confirmation(to: &str, confirm_url: &str) -> Self {
        Self {
            to: to.to_string(),
            kind: MessageKind::Confirmation,
            subject: "Confirm Your Table Reservation".into(),
            html: format!(
                "<p>Thanks for booking with us!</p>\
                 <p>Please confirm your reservation within 15 minutes by clicking the link below:</p>\
                 <a href=\"{confirm_url}\">{confirm_url}</a>"
            ),
        }
    }

    pub fn cancellation(to: &str, reservation_id: Ulid) -> Self {
        Self {
            to: to.to_string(),
            kind: MessageKind::Cancellation,
            subject: "Your Table Reservation Was Cancelled".into(),
            html: format!(
                "<p>Your reservation <strong>{reservation_id}</strong> has been cancelled.</p>\
                 <p>Please contact us if you would like to book another time.</p>"
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail relay unreachable: {0}")]
    Transport(String),
    #[error("mail relay rejected message with status {0}")]
    Rejected(u16),
    #[error("mail delivery timed out")]
    Timeout,
}

/// Delivery capability for holder messages. Implementations may be slow or
/// fail; callers never wait on them inside a state transition.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &Message) -> Result<(), MailError> {
        info!(to = %message.to, kind = ?message.kind, "mail: {}", message.subject);
        Ok(())
    }
}

/// Posts each message as JSON to an HTTP mail relay.
#[derive(Debug)]
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: String, timeout: Duration) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, message: &Message) -> Result<(), MailError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MailError::Timeout
                } else {
                    MailError::Transport(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
