//! Outbound message delivery.
//!
//! SMTP (lettre) when a URL is configured, otherwise messages are only logged
//! so local runs work without a mail server.

use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
};

/// One message for an email address or phone number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub subject: Option<String>,
    pub body: String,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subject: None,
            body: body.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Delivery channel used by the OTP and premium engines.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// SMTP sender using lettre.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSender {
    pub fn new(smtp_url: &str, from: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(smtp_url)?.build();
        Ok(Self {
            transport,
            from: from.parse()?,
        })
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, message.destination.parse()?))
            .subject(message.subject.as_deref().unwrap_or_default())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())?;

        self.transport.send(email).await?;
        tracing::debug!(destination = %message.destination, "message sent via smtp");
        Ok(())
    }
}

/// Development sender that only logs.
#[derive(Debug, Clone, Default)]
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        tracing::info!(
            destination = %message.destination,
            subject = message.subject.as_deref().unwrap_or(""),
            body = %message.body,
            "outbound message (not delivered)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn smtp_sender_rejects_bad_from_address() {
        assert!(SmtpSender::new("smtp://localhost:1025", "not an address").is_err());
    }

    #[tokio::test]
    async fn smtp_sender_accepts_named_mailbox() {
        assert!(SmtpSender::new("smtp://localhost:1025", "Matrimony <noreply@example.com>").is_ok());
    }

    #[tokio::test]
    async fn log_sender_always_succeeds() {
        let message = OutboundMessage::new("a@b.com", "hello").with_subject("Hi");
        assert!(LogSender.send(&message).await.is_ok());
    }
}
