//! Alarm notifications
//!
//! The dispatcher only sees the transport traits below; concrete channels
//! (SMTP, Twilio, Telegram) are built from configuration at startup.

pub mod dispatcher;
#[cfg(feature = "smtp")]
pub mod email;
pub mod message;
pub mod sms;
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use errors::{IgnisError, IgnisResult};
use tracing::{info, warn};

use crate::config::NotificationConfig;

pub use dispatcher::{NotificationDispatcher, NotificationSettings};
pub use message::AlarmMessage;

/// Sends an HTML mail, returns the transport's message id
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> IgnisResult<String>;
}

/// Sends a text message, returns the provider's message id
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> IgnisResult<String>;
}

/// Chat bot with photo and text messages
#[async_trait]
pub trait BotTransport: Send + Sync {
    async fn send_photo(&self, chat_id: &str, photo: Bytes, caption: &str) -> IgnisResult<()>;

    async fn send_text(&self, chat_id: &str, text: &str) -> IgnisResult<()>;
}

/// Configured channel transports; `None` means the channel is not wired
#[derive(Clone, Default)]
pub struct Transports {
    pub email: Option<Arc<dyn EmailTransport>>,
    pub sms: Option<Arc<dyn SmsTransport>>,
    pub bot: Option<Arc<dyn BotTransport>>,
}

impl Transports {
    /// Build a transport for every enabled channel
    pub fn from_config(config: &NotificationConfig) -> IgnisResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| IgnisError::config(format!("HTTP client: {e}")))?;

        let mut transports = Transports::default();

        if config.email.enabled {
            #[cfg(feature = "smtp")]
            {
                transports.email = Some(Arc::new(email::SmtpMailer::new(&config.email)?));
                info!(
                    "Email channel: {}:{}",
                    config.email.smtp_host, config.email.smtp_port
                );
            }
            #[cfg(not(feature = "smtp"))]
            {
                warn!("Email enabled but built without SMTP support");
            }
        }

        if config.sms.enabled {
            transports.sms = Some(Arc::new(sms::TwilioSms::new(http.clone(), &config.sms)));
            info!("SMS channel: {}", config.sms.api_base);
        }

        if config.telegram.enabled {
            transports.bot = Some(Arc::new(telegram::TelegramBot::new(http, &config.telegram)));
            info!("Telegram channel: {}", config.telegram.api_base);
        }

        if transports.email.is_none() && transports.sms.is_none() && transports.bot.is_none() {
            warn!("No notification channel configured");
        }
        Ok(transports)
    }
}
