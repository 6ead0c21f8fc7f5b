//! Reference schema for the tables the pipeline reads and writes
//!
//! Schema ownership lies with the surrounding application; these statements
//! are idempotent and only fill in what is missing.

use crate::store::{DataStore, StoreResult};

/// Sites with optional fieldbus / building-automation endpoints
pub const BUILDINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS buildings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        modbus_ip TEXT,
        modbus_port INTEGER DEFAULT 502,
        modbus_config TEXT,
        bacnet_ip TEXT,
        bacnet_port INTEGER DEFAULT 47808,
        bacnet_device_id INTEGER
    );
"#;

pub const FLOORS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS floors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        building_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        level INTEGER DEFAULT 0
    );
"#;

/// Field devices; `device_id` matches the logical point name
pub const DEVICES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        floor_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        name TEXT,
        location TEXT
    );
"#;

pub const ALERTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        element_id TEXT NOT NULL,
        type TEXT NOT NULL,
        building_id INTEGER,
        floor_id INTEGER,
        location TEXT,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        origin TEXT NOT NULL DEFAULT 'REAL',
        started_at TEXT NOT NULL,
        ended_at TEXT
    );
"#;

/// At most one ACTIVE alarm per element
pub const ALERTS_ACTIVE_INDEX: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_one_active
        ON alerts(element_id) WHERE status = 'ACTIVE';
"#;

/// Alarm history shown on the dashboard timeline
pub const EVENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT,
        type TEXT NOT NULL,
        message TEXT,
        value TEXT,
        origin TEXT,
        building_id INTEGER,
        floor_id INTEGER,
        timestamp TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0
    );
"#;

pub const NOTIFICATION_RECIPIENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS notification_recipients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT,
        phone TEXT,
        telegram_chat_id TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        notify_email INTEGER NOT NULL DEFAULT 1,
        notify_sms INTEGER NOT NULL DEFAULT 0,
        notify_telegram INTEGER NOT NULL DEFAULT 0,
        sms_critical_only INTEGER NOT NULL DEFAULT 1
    );
"#;

/// Append-only, one row per delivery attempt
pub const NOTIFICATION_LOG_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS notification_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        alarm_id INTEGER NOT NULL,
        recipient_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        sent_at TEXT NOT NULL
    );
"#;

/// Every reference statement in dependency order
pub const PIPELINE_SCHEMA: &[&str] = &[
    BUILDINGS_TABLE,
    FLOORS_TABLE,
    DEVICES_TABLE,
    ALERTS_TABLE,
    ALERTS_ACTIVE_INDEX,
    EVENTS_TABLE,
    NOTIFICATION_RECIPIENTS_TABLE,
    NOTIFICATION_LOG_TABLE,
];

/// Create any missing reference table or index
pub async fn ensure_schema(store: &dyn DataStore) -> StoreResult<()> {
    for statement in PIPELINE_SCHEMA {
        store.exec(statement).await?;
    }
    Ok(())
}
