//! Notification fan-out
//!
//! Every enabled recipient is handled concurrently, and so is every channel
//! of a recipient. A failed attempt never stops the others, and each attempt
//! leaves exactly one `notification_log` row.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use common::{params, DataStore, StoreResult};
use errors::{log_error, IgnisResult};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AlarmMessage, Transports};
use crate::domain::{AlarmEvent, AlarmRecord, Channel, DeliveryStatus, Origin, Recipient};
use crate::evidence::EvidenceSource;

/// Runtime-switchable channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Origins that trigger notifications at all
    pub notify_origins: Vec<Origin>,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub telegram_enabled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            notify_origins: vec![Origin::Real],
            email_enabled: false,
            sms_enabled: false,
            telegram_enabled: false,
        }
    }
}

impl NotificationSettings {
    pub fn is_eligible(&self, origin: Origin) -> bool {
        self.notify_origins.contains(&origin)
    }

    fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_enabled,
            Channel::Sms => self.sms_enabled,
            Channel::Telegram => self.telegram_enabled,
        }
    }
}

/// One channel attempt for one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub recipient_id: i64,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}

/// Per-alarm state shared by all recipients
struct Delivery<'a> {
    record: &'a AlarmRecord,
    message: AlarmMessage,
    settings: NotificationSettings,
    /// Captured on first use, at most once per alarm
    evidence: OnceCell<Option<Bytes>>,
}

pub struct NotificationDispatcher {
    store: Arc<dyn DataStore>,
    transports: Transports,
    evidence: Arc<dyn EvidenceSource>,
    settings: RwLock<NotificationSettings>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn DataStore>,
        transports: Transports,
        evidence: Arc<dyn EvidenceSource>,
        settings: NotificationSettings,
    ) -> Self {
        Self {
            store,
            transports,
            evidence,
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> NotificationSettings {
        self.settings.read().clone()
    }

    /// Applies to alarms dispatched after the call
    pub fn update_settings(&self, settings: NotificationSettings) {
        info!(
            "Notification settings: origins={:?} email={} sms={} telegram={}",
            settings.notify_origins,
            settings.email_enabled,
            settings.sms_enabled,
            settings.telegram_enabled
        );
        *self.settings.write() = settings;
    }

    /// Handle alarm events one at a time until every sender is gone
    pub fn spawn(
        self: Arc<Self>,
        mut alarms: mpsc::UnboundedReceiver<AlarmEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = alarms.recv().await {
                if let Err(e) = self.on_alarm_event(&event).await {
                    log_error!(e, "Notification dispatch failed");
                }
            }
            info!("Dispatcher stopped");
        })
    }

    pub async fn on_alarm_event(&self, event: &AlarmEvent) -> IgnisResult<Vec<DeliveryAttempt>> {
        match event {
            AlarmEvent::Opened(record) => self.on_alarm_opened(record).await,
            AlarmEvent::BulkOpened(records) => match records.first() {
                Some(first) => {
                    info!("Bulk alarm ({} records), notifying once", records.len());
                    self.on_alarm_opened(first).await
                },
                None => Ok(Vec::new()),
            },
            AlarmEvent::Closed(record) => {
                debug!("Alarm {} closed, no notification", record.id);
                Ok(Vec::new())
            },
        }
    }

    pub async fn on_alarm_opened(&self, record: &AlarmRecord) -> IgnisResult<Vec<DeliveryAttempt>> {
        let settings = self.settings();
        if !settings.is_eligible(record.origin) {
            debug!("Alarm {} origin {} not notified", record.id, record.origin);
            return Ok(Vec::new());
        }

        let recipients = self.enabled_recipients().await?;
        if recipients.is_empty() {
            info!("Alarm {}: no enabled recipients", record.id);
            return Ok(Vec::new());
        }

        let delivery = Delivery {
            record,
            message: self.resolve_message(record).await,
            settings,
            evidence: OnceCell::new(),
        };
        info!(
            "Alarm {} [{}]: notifying {} recipients",
            record.id,
            delivery.message.priority,
            recipients.len()
        );

        let attempts: Vec<DeliveryAttempt> = join_all(
            recipients
                .iter()
                .map(|recipient| self.notify_recipient(&delivery, recipient)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let sent = attempts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Sent)
            .count();
        info!(
            "Alarm {}: {}/{} deliveries sent",
            record.id,
            sent,
            attempts.len()
        );
        Ok(attempts)
    }

    async fn enabled_recipients(&self) -> IgnisResult<Vec<Recipient>> {
        let rows = self
            .store
            .query(
                "SELECT * FROM notification_recipients WHERE enabled = 1 ORDER BY id",
                &[],
            )
            .await?;
        let recipients = rows
            .iter()
            .map(Recipient::from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(recipients)
    }

    /// Name lookups are best effort
    async fn resolve_message(&self, record: &AlarmRecord) -> AlarmMessage {
        let building = self
            .lookup_name("SELECT name FROM buildings WHERE id = ?", record.building_id)
            .await;
        let floor = match record.floor.floor_id() {
            Some(floor_id) => {
                self.lookup_name("SELECT name FROM floors WHERE id = ?", floor_id)
                    .await
            },
            None => None,
        };
        AlarmMessage::new(record, building, floor)
    }

    async fn lookup_name(&self, sql: &str, id: i64) -> Option<String> {
        match self.store.get(sql, &params![id]).await {
            Ok(row) => row.and_then(|r| r.opt_string("name")),
            Err(e) => {
                warn!("Name lookup for {} failed: {}", id, e);
                None
            },
        }
    }

    async fn notify_recipient(
        &self,
        delivery: &Delivery<'_>,
        recipient: &Recipient,
    ) -> Vec<DeliveryAttempt> {
        let wanted = |channel| {
            delivery.settings.channel_enabled(channel)
                && recipient.wants(channel, delivery.message.priority)
        };

        let email = async {
            if wanted(Channel::Email) {
                let result = self.deliver_email(delivery, recipient).await;
                Some(self.record_attempt(delivery, recipient, Channel::Email, result).await)
            } else {
                None
            }
        };
        let sms = async {
            if wanted(Channel::Sms) {
                let result = self.deliver_sms(delivery, recipient).await;
                Some(self.record_attempt(delivery, recipient, Channel::Sms, result).await)
            } else {
                None
            }
        };
        let telegram = async {
            if wanted(Channel::Telegram) {
                let result = self.deliver_telegram(delivery, recipient).await;
                Some(
                    self.record_attempt(delivery, recipient, Channel::Telegram, result)
                        .await,
                )
            } else {
                None
            }
        };

        let (email, sms, telegram) = tokio::join!(email, sms, telegram);
        [email, sms, telegram].into_iter().flatten().collect()
    }

    async fn deliver_email(
        &self,
        delivery: &Delivery<'_>,
        recipient: &Recipient,
    ) -> Result<(), String> {
        let Some(address) = recipient.email.as_deref() else {
            return Err("No email address".to_string());
        };
        let Some(transport) = &self.transports.email else {
            return Err("Email transport not configured".to_string());
        };
        let message = &delivery.message;
        let id = transport
            .send(address, &message.subject(), &message.email_html())
            .await
            .map_err(|e| e.to_string())?;
        debug!("Email to {}: {}", address, id);
        Ok(())
    }

    async fn deliver_sms(
        &self,
        delivery: &Delivery<'_>,
        recipient: &Recipient,
    ) -> Result<(), String> {
        let Some(phone) = recipient.phone.as_deref() else {
            return Err("No phone number".to_string());
        };
        let Some(transport) = &self.transports.sms else {
            return Err("SMS transport not configured".to_string());
        };
        let sid = transport
            .send(phone, &delivery.message.sms_text())
            .await
            .map_err(|e| e.to_string())?;
        debug!("SMS to {}: {}", phone, sid);
        Ok(())
    }

    /// Photo with caption when evidence exists, text otherwise
    async fn deliver_telegram(
        &self,
        delivery: &Delivery<'_>,
        recipient: &Recipient,
    ) -> Result<(), String> {
        let Some(chat_id) = recipient.telegram_chat_id.as_deref() else {
            return Err("No chat id".to_string());
        };
        let Some(bot) = &self.transports.bot else {
            return Err("Telegram transport not configured".to_string());
        };
        let caption = delivery.message.telegram_caption();

        if let Some(photo) = self.evidence_for(delivery).await {
            match bot.send_photo(chat_id, photo, &caption).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Photo to chat {} failed, sending text: {}", chat_id, e),
            }
        }
        bot.send_text(chat_id, &caption)
            .await
            .map_err(|e| e.to_string())
    }

    async fn evidence_for(&self, delivery: &Delivery<'_>) -> Option<Bytes> {
        let record = delivery.record;
        delivery
            .evidence
            .get_or_init(|| async {
                match self
                    .evidence
                    .capture(record.floor, record.device_id(), record.building_id)
                    .await
                {
                    Ok(Some(image)) if !image.is_empty() => Some(image),
                    Ok(_) => {
                        debug!("No evidence for alarm {}", record.id);
                        None
                    },
                    Err(e) => {
                        warn!("Evidence for alarm {} failed: {}", record.id, e);
                        None
                    },
                }
            })
            .await
            .clone()
    }

    async fn record_attempt(
        &self,
        delivery: &Delivery<'_>,
        recipient: &Recipient,
        channel: Channel,
        result: Result<(), String>,
    ) -> DeliveryAttempt {
        let (status, error) = match result {
            Ok(()) => {
                info!("{} to {} sent", channel, recipient.name);
                (DeliveryStatus::Sent, None)
            },
            Err(e) => {
                warn!("{} to {} failed: {}", channel, recipient.name, e);
                (DeliveryStatus::Failed, Some(e))
            },
        };

        if let Err(e) = self
            .store
            .run(
                "INSERT INTO notification_log \
                 (alarm_id, recipient_id, type, status, error_message, sent_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                &params![
                    delivery.record.id,
                    recipient.id,
                    channel.as_str(),
                    status.as_str(),
                    error.clone(),
                    Utc::now(),
                ],
            )
            .await
        {
            error!(
                "Notification log for alarm {} not written: {}",
                delivery.record.id, e
            );
        }

        DeliveryAttempt {
            recipient_id: recipient.id,
            channel,
            status,
            error,
        }
    }
}
