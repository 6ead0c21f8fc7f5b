//! Shared fixtures for pipeline tests
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarmsrv::domain::{FloorAssignment, Origin, PointKind, SignalChanged};
use alarmsrv::evidence::EvidenceSource;
use alarmsrv::notify::{BotTransport, EmailTransport, SmsTransport, Transports};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use common::sqlite::{ensure_schema, SqliteStore};
use common::DataStore;
use errors::{IgnisError, IgnisResult};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Building 1 "HQ" with two floors, three field devices and three recipients
pub async fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    ensure_schema(store.as_ref()).await.unwrap();
    store
        .exec(
            "INSERT INTO buildings (id, name) VALUES (1, 'HQ');
             INSERT INTO floors (id, building_id, name) VALUES (10, 1, 'Ground'), (11, 1, 'First');
             INSERT INTO devices (device_id, floor_id, type, name, location) VALUES
                 ('det1', 10, 'detector', 'Lobby detector', 'Lobby'),
                 ('det2', 11, 'detector', 'Archive detector', 'Archive'),
                 ('pull1', 10, 'pulsador', 'Main exit call point', 'Main exit');
             INSERT INTO notification_recipients
                 (id, name, email, phone, telegram_chat_id,
                  notify_email, notify_sms, notify_telegram, sms_critical_only, enabled)
             VALUES
                 (1, 'Ana', 'ana@example.com', '+34600000001', '1001', 1, 1, 1, 1, 1);",
        )
        .await
        .unwrap();
    store
}

pub async fn add_recipient(store: &SqliteStore, id: i64, name: &str, chat_id: &str) {
    store
        .run(
            "INSERT INTO notification_recipients
                 (id, name, email, phone, telegram_chat_id,
                  notify_email, notify_sms, notify_telegram, sms_critical_only, enabled)
             VALUES (?, ?, ?, ?, ?, 1, 1, 1, 1, 1)",
            &common::params![
                id,
                name,
                format!("{}@example.com", name.to_lowercase()),
                format!("+3460000000{id}"),
                chat_id
            ],
        )
        .await
        .unwrap();
}

/// `(recipient_id, type, status)` for every delivery attempt of an alarm
pub async fn delivery_log(store: &SqliteStore, alarm_id: i64) -> Vec<(i64, String, String)> {
    store
        .query(
            "SELECT recipient_id, type, status FROM notification_log
             WHERE alarm_id = ? ORDER BY recipient_id, type",
            &common::params![alarm_id],
        )
        .await
        .unwrap()
        .into_iter()
        .map(|row| {
            (
                row.i64("recipient_id").unwrap(),
                row.string("type").unwrap(),
                row.string("status").unwrap(),
            )
        })
        .collect()
}

pub async fn count(store: &SqliteStore, sql: &str) -> i64 {
    store
        .get(&format!("SELECT COUNT(*) AS n FROM {sql}"), &[])
        .await
        .unwrap()
        .unwrap()
        .i64("n")
        .unwrap()
}

/// Poll `check` until it holds or `limit` elapses
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

pub fn edge(point: &str, value: bool, kind: PointKind) -> SignalChanged {
    SignalChanged {
        site_id: "B1".to_string(),
        building_id: 1,
        point_id: point.to_string(),
        address: 0,
        value,
        source: Origin::Real,
        kind,
        description: format!("{point} changed"),
        timestamp: Utc::now(),
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Records every delivery; email can be made to fail
#[derive(Default)]
pub struct Outbox {
    pub emails: Mutex<Vec<String>>,
    pub sms: Mutex<Vec<String>>,
    pub photos: Mutex<Vec<String>>,
    pub texts: Mutex<Vec<String>>,
    pub fail_email: bool,
}

impl Outbox {
    pub fn failing_email() -> Self {
        Self {
            fail_email: true,
            ..Self::default()
        }
    }

    pub fn transports(self: &Arc<Self>) -> Transports {
        Transports {
            email: Some(Arc::clone(self) as Arc<dyn EmailTransport>),
            sms: Some(Arc::clone(self) as Arc<dyn SmsTransport>),
            bot: Some(Arc::clone(self) as Arc<dyn BotTransport>),
        }
    }
}

#[async_trait]
impl EmailTransport for Outbox {
    async fn send(&self, to: &str, _: &str, _: &str) -> IgnisResult<String> {
        if self.fail_email {
            return Err(IgnisError::notification("EMAIL", "connection refused"));
        }
        self.emails.lock().push(to.to_string());
        Ok("250 queued".to_string())
    }
}

#[async_trait]
impl SmsTransport for Outbox {
    async fn send(&self, to: &str, _: &str) -> IgnisResult<String> {
        self.sms.lock().push(to.to_string());
        Ok("SM1".to_string())
    }
}

#[async_trait]
impl BotTransport for Outbox {
    async fn send_photo(&self, chat_id: &str, _: Bytes, _: &str) -> IgnisResult<()> {
        self.photos.lock().push(chat_id.to_string());
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, _: &str) -> IgnisResult<()> {
        self.texts.lock().push(chat_id.to_string());
        Ok(())
    }
}

/// Evidence source with a fixed answer
pub struct FixedEvidence {
    pub image: Option<Bytes>,
    pub calls: AtomicUsize,
    /// (device id, building id) of every capture
    pub requests: Mutex<Vec<(String, i64)>>,
}

impl FixedEvidence {
    pub fn image() -> Arc<Self> {
        Arc::new(Self {
            image: Some(Bytes::from_static(b"jpeg")),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn absent() -> Arc<Self> {
        Arc::new(Self {
            image: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EvidenceSource for FixedEvidence {
    async fn capture(
        &self,
        _: FloorAssignment,
        device_id: &str,
        building_id: i64,
    ) -> IgnisResult<Option<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((device_id.to_string(), building_id));
        Ok(self.image.clone())
    }
}

// ============================================================================
// Field device
// ============================================================================

/// Modbus TCP slave answering single-byte bit reads from shared state
pub struct FakeSlave {
    pub port: u16,
    inputs: Arc<AtomicU8>,
    requests: Arc<AtomicUsize>,
}

impl FakeSlave {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let inputs = Arc::new(AtomicU8::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        let (state, served) = (Arc::clone(&inputs), Arc::clone(&requests));
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (state, served) = (Arc::clone(&state), Arc::clone(&served));
                tokio::spawn(async move {
                    let mut req = [0u8; 12];
                    while socket.read_exact(&mut req).await.is_ok() {
                        let bits = state.load(Ordering::SeqCst);
                        let resp = [
                            req[0], req[1], 0x00, 0x00, 0x00, 0x04, req[6], req[7], 0x01, bits,
                        ];
                        if socket.write_all(&resp).await.is_err() {
                            break;
                        }
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        Self {
            port,
            inputs,
            requests,
        }
    }

    pub fn set(&self, bit: u8, on: bool) {
        let mask = 1u8 << bit;
        if on {
            self.inputs.fetch_or(mask, Ordering::SeqCst);
        } else {
            self.inputs.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}
