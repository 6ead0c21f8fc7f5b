//! Domain model for the alarm pipeline
//!
//! Signals, alarm records, recipients and the small enums shared by
//! the lifecycle manager and the dispatcher.

pub mod alarm;
pub mod recipient;
pub mod types;

pub use alarm::{building_site_id, element_id, AlarmEvent, AlarmRecord, SignalChanged};
pub use recipient::Recipient;
pub use types::*;
