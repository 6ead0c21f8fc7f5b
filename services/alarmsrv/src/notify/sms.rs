//! Twilio SMS channel

use async_trait::async_trait;
use errors::{IgnisError, IgnisResult};
use serde::Deserialize;
use tracing::debug;

use super::SmsTransport;
use crate::config::SmsConfig;

/// Subset of the Messages resource we read back
#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: Option<String>,
    message: Option<String>,
}

pub struct TwilioSms {
    http: reqwest::Client,
    endpoint: String,
    account_sid: String,
    auth_token: String,
    from: String,
}

impl TwilioSms {
    pub fn new(http: reqwest::Client, config: &SmsConfig) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                config.api_base.trim_end_matches('/'),
                config.account_sid
            ),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from: config.from_number.clone(),
        }
    }
}

#[async_trait]
impl SmsTransport for TwilioSms {
    async fn send(&self, to: &str, body: &str) -> IgnisResult<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", self.from.as_str()), ("Body", body)])
            .send()
            .await?;

        let status = response.status();
        let reply: MessageResponse = response.json().await.map_err(|e| {
            IgnisError::notification("SMS", format!("HTTP {status}: unreadable reply: {e}"))
        })?;

        match (status.is_success(), reply.sid) {
            (true, Some(sid)) => {
                debug!("SMS to {} queued: {}", to, sid);
                Ok(sid)
            },
            _ => Err(IgnisError::notification(
                "SMS",
                reply
                    .message
                    .unwrap_or_else(|| format!("HTTP {status}")),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sms(server: &MockServer) -> TwilioSms {
        TwilioSms::new(
            reqwest::Client::new(),
            &SmsConfig {
                enabled: true,
                account_sid: "AC123".to_string(),
                auth_token: "secret".to_string(),
                from_number: "+15550001".to_string(),
                api_base: server.uri(),
            },
        )
    }

    #[tokio::test]
    async fn test_send_returns_sid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B34600111222"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"sid": "SM42", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sid = sms(&server).send("+34600111222", "FIRE ALARM").await.unwrap();
        assert_eq!(sid, "SM42");
    }

    #[tokio::test]
    async fn test_api_error_carries_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number.",
            })))
            .mount(&server)
            .await;

        let err = sms(&server).send("bogus", "FIRE ALARM").await.unwrap_err();
        assert!(err.to_string().contains("not a valid phone number"));
    }
}
