use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance of an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    /// Hardware-sourced
    Real,
    /// Raised by a simulator
    Simulated,
    /// Raised by a drill or test
    Test,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Real => "REAL",
            Origin::Simulated => "SIMULATED",
            Origin::Test => "TEST",
        }
    }

    /// Default origin for a site host that declares none
    pub fn for_host(host: &str) -> Self {
        match host {
            "127.0.0.1" | "localhost" | "::1" => Origin::Simulated,
            _ => Origin::Real,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REAL" => Ok(Origin::Real),
            "SIMULATED" => Ok(Origin::Simulated),
            "TEST" => Ok(Origin::Test),
            other => Err(format!("Unknown origin: {other}")),
        }
    }
}

/// Alarm status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    Active,
    Resolved,
}

impl AlarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Active => "ACTIVE",
            AlarmStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for AlarmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AlarmStatus::Active),
            "RESOLVED" => Ok(AlarmStatus::Resolved),
            other => Err(format!("Unknown alarm status: {other}")),
        }
    }
}

/// What a logical point represents in the field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    /// Smoke/heat detector
    Detector,
    /// Manual call point
    PullStation,
    /// Siren or bell
    Sounder,
    /// Generic alarm contact
    #[default]
    BinaryAlarm,
    /// Supervisory or status input, never raises an alarm
    Status,
}

impl PointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointKind::Detector => "detector",
            PointKind::PullStation => "pull_station",
            PointKind::Sounder => "sounder",
            PointKind::BinaryAlarm => "binary_alarm",
            PointKind::Status => "status",
        }
    }

    pub fn is_alarm_relevant(&self) -> bool {
        !matches!(self, PointKind::Status)
    }

    /// Map a `devices.type` value; unknown types yield `None`
    pub fn from_device_type(device_type: &str) -> Option<Self> {
        match device_type.trim().to_ascii_lowercase().as_str() {
            "detector" | "smoke_detector" | "heat_detector" | "detector_humo" => {
                Some(PointKind::Detector)
            },
            "pull_station" | "manual_call_point" | "pulsador" => Some(PointKind::PullStation),
            "sounder" | "siren" | "sirena" | "bell" => Some(PointKind::Sounder),
            "binary_alarm" | "alarm" => Some(PointKind::BinaryAlarm),
            "status" | "supervisory" => Some(PointKind::Status),
            _ => None,
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    Normal,
}

impl Priority {
    /// Hardware alarms are critical, everything else normal
    pub fn classify(origin: Origin) -> Self {
        if origin == Origin::Real {
            Priority::Critical
        } else {
            Priority::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::Normal => "NORMAL",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Priority::Critical => "#dc2626",
            Priority::Normal => "#f59e0b",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Sms,
    Telegram,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Telegram => "TELEGRAM",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

/// Floor placement of an alarm source
///
/// `Unmapped` is stored as a NULL `floor_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorAssignment {
    Mapped(i64),
    Unmapped,
}

impl FloorAssignment {
    pub fn floor_id(&self) -> Option<i64> {
        match self {
            FloorAssignment::Mapped(id) => Some(*id),
            FloorAssignment::Unmapped => None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, FloorAssignment::Mapped(_))
    }
}

impl From<Option<i64>> for FloorAssignment {
    fn from(floor_id: Option<i64>) -> Self {
        floor_id.map_or(FloorAssignment::Unmapped, FloorAssignment::Mapped)
    }
}
