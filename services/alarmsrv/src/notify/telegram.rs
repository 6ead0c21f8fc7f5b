//! Telegram bot channel

use async_trait::async_trait;
use bytes::Bytes;
use errors::{IgnisError, IgnisResult};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;

use super::BotTransport;
use crate::config::TelegramConfig;

const PHOTO_NAME: &str = "alarm_view.jpg";

/// Bot API envelope; only the status fields are read
#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramBot {
    http: reqwest::Client,
    base: String,
}

impl TelegramBot {
    pub fn new(http: reqwest::Client, config: &TelegramConfig) -> Self {
        Self {
            http,
            base: format!(
                "{}/bot{}",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }

    async fn check(response: reqwest::Response) -> IgnisResult<()> {
        let status = response.status();
        let reply: ApiReply = response.json().await.map_err(|e| {
            IgnisError::notification("TELEGRAM", format!("HTTP {status}: unreadable reply: {e}"))
        })?;
        if reply.ok {
            Ok(())
        } else {
            Err(IgnisError::notification(
                "TELEGRAM",
                reply
                    .description
                    .unwrap_or_else(|| format!("HTTP {status}")),
            ))
        }
    }
}

#[async_trait]
impl BotTransport for TelegramBot {
    async fn send_photo(&self, chat_id: &str, photo: Bytes, caption: &str) -> IgnisResult<()> {
        let part = Part::bytes(photo.to_vec())
            .file_name(PHOTO_NAME)
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .part("photo", part);

        let response = self
            .http
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> IgnisResult<()> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;
        Self::check(response).await
    }
}
