//! SMTP channel

use async_trait::async_trait;
use errors::{IgnisError, IgnisResult};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::EmailTransport;
use crate::config::EmailConfig;

/// Implicit-TLS submission port; anything else uses STARTTLS
const SMTPS_PORT: u16 = 465;

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> IgnisResult<Self> {
        let builder = if config.smtp_port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| IgnisError::invalid_config("notifications.email.smtp_host", e.to_string()))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        let sender = if config.from.is_empty() {
            &config.username
        } else {
            &config.from
        };
        let from = sender
            .parse::<Mailbox>()
            .map_err(|e| IgnisError::invalid_config("notifications.email.from", e.to_string()))?;

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> IgnisResult<String> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| IgnisError::notification("EMAIL", format!("Invalid address {to}: {e}")))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| IgnisError::notification("EMAIL", e.to_string()))?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| IgnisError::notification("EMAIL", e.to_string()))?;

        let id = response
            .message()
            .next()
            .map_or_else(|| response.code().to_string(), str::to_string);
        debug!("Mail accepted: {}", id);
        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn config(from: &str) -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            username: "alarms@example.com".to_string(),
            password: "secret".to_string(),
            from: from.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sender_defaults_to_username() {
        let mailer = SmtpMailer::new(&config("")).unwrap();
        assert_eq!(mailer.from.email.to_string(), "alarms@example.com");

        let named = SmtpMailer::new(&config("Fire Panel <panel@example.com>")).unwrap();
        assert_eq!(named.from.name.as_deref(), Some("Fire Panel"));
    }

    #[tokio::test]
    async fn test_invalid_sender_rejected() {
        assert!(SmtpMailer::new(&config("not an address")).is_err());
    }
}
