//! Fire alarm ingestion and dispatch
//!
//! Field pollers sample binary points over Modbus TCP and BACnet/IP, the
//! lifecycle manager turns their edges into deduplicated alarm records, and
//! the dispatcher fans alarms out to email, SMS and Telegram with an optional
//! floor-plan snapshot.

pub mod bus;
pub mod config;
pub mod domain;
pub mod evidence;
pub mod lifecycle;
pub mod notify;
pub mod poller;
pub mod service;

pub use config::AppConfig;
pub use lifecycle::{AlarmLifecycleManager, LifecycleOutcome};
pub use notify::{NotificationDispatcher, NotificationSettings};
pub use service::AlarmPipeline;
