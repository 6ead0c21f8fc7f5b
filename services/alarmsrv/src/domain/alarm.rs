//! Alarm record and the events that flow between pipeline stages

use chrono::{DateTime, Utc};
use common::{Row, StoreError, StoreResult};
use serde::Serialize;
use serde_json::{json, Value};

use super::types::{AlarmStatus, FloorAssignment, Origin, PointKind};

/// Identity of an alarm source: `"{point}@{site}"`
pub fn element_id(point_id: &str, site_id: &str) -> String {
    format!("{point_id}@{site_id}")
}

/// Site id given to store-backed buildings
pub fn building_site_id(building_id: i64) -> String {
    format!("B{building_id}")
}

/// A point changed value after having a known value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalChanged {
    pub site_id: String,
    pub building_id: i64,
    pub point_id: String,
    /// Raw protocol address of the point
    pub address: u32,
    pub value: bool,
    pub source: Origin,
    pub kind: PointKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl SignalChanged {
    pub fn element_id(&self) -> String {
        element_id(&self.point_id, &self.site_id)
    }
}

/// Persisted alarm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub element_id: String,
    pub kind: PointKind,
    pub building_id: i64,
    pub floor: FloorAssignment,
    pub location: Option<String>,
    pub description: String,
    pub status: AlarmStatus,
    pub origin: Origin,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AlarmRecord {
    /// Device part of the element id, without the site suffix
    pub fn device_id(&self) -> &str {
        self.element_id
            .rsplit_once('@')
            .map_or(self.element_id.as_str(), |(device, _)| device)
    }

    /// Decode an `alerts` row
    pub fn from_row(row: &Row) -> StoreResult<Self> {
        let kind_text = row.string("type")?;
        let status_text = row.string("status")?;
        let origin_text = row.string("origin")?;

        Ok(Self {
            id: row.i64("id")?,
            element_id: row.string("element_id")?,
            kind: PointKind::from_device_type(&kind_text).unwrap_or_default(),
            building_id: row.opt_i64("building_id").unwrap_or_default(),
            floor: row.opt_i64("floor_id").into(),
            location: row.opt_string("location"),
            description: row.opt_string("description").unwrap_or_default(),
            status: status_text
                .parse()
                .map_err(|e: String| StoreError::column("status", e))?,
            origin: origin_text
                .parse()
                .map_err(|e: String| StoreError::column("origin", e))?,
            started_at: row.timestamp("started_at")?,
            ended_at: row.opt_timestamp("ended_at"),
        })
    }

    /// Dashboard payload for `pci:alarm:on` / `pci:alarm:off`
    pub fn to_payload(&self) -> Value {
        json!({
            "id": self.id,
            "element_id": self.element_id,
            "type": self.kind.as_str(),
            "building_id": self.building_id,
            "floor_id": self.floor.floor_id(),
            "floor_mapped": self.floor.is_mapped(),
            "location": self.location,
            "description": self.description,
            "status": self.status.as_str(),
            "origin": self.origin.as_str(),
            "started_at": self.started_at.to_rfc3339(),
            "ended_at": self.ended_at.map(|t| t.to_rfc3339()),
        })
    }
}

/// Lifecycle output consumed by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmEvent {
    Opened(AlarmRecord),
    Closed(AlarmRecord),
    /// A drill opened several alarms at once
    BulkOpened(Vec<AlarmRecord>),
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use common::SqlValue;

    fn alert_row() -> Row {
        let mut row = Row::new();
        row.insert("id", SqlValue::Integer(7));
        row.insert("element_id", SqlValue::from("det1@B1"));
        row.insert("type", SqlValue::from("detector"));
        row.insert("building_id", SqlValue::Integer(1));
        row.insert("floor_id", SqlValue::Null);
        row.insert("location", SqlValue::from("B1 addr 0"));
        row.insert("description", SqlValue::from("Alarm det1"));
        row.insert("status", SqlValue::from("ACTIVE"));
        row.insert("origin", SqlValue::from("REAL"));
        row.insert("started_at", SqlValue::from("2024-03-01T10:00:00.000Z"));
        row.insert("ended_at", SqlValue::Null);
        row
    }

    #[test]
    fn test_record_from_row() {
        let record = AlarmRecord::from_row(&alert_row()).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.kind, PointKind::Detector);
        assert_eq!(record.floor, FloorAssignment::Unmapped);
        assert_eq!(record.status, AlarmStatus::Active);
        assert!(record.ended_at.is_none());

        let payload = record.to_payload();
        assert_eq!(payload["floor_id"], Value::Null);
        assert_eq!(payload["floor_mapped"], false);
    }

    #[test]
    fn test_record_rejects_unknown_status() {
        let mut row = alert_row();
        row.insert("status", SqlValue::from("PENDING"));
        assert!(AlarmRecord::from_row(&row).is_err());
    }

    #[test]
    fn test_element_id_format() {
        assert_eq!(element_id("det1", &building_site_id(1)), "det1@B1");
    }

    #[test]
    fn test_device_id_strips_site() {
        let mut record = AlarmRecord::from_row(&alert_row()).unwrap();
        assert_eq!(record.device_id(), "det1");

        record.element_id = element_id("zone@east", "PANEL-2");
        assert_eq!(record.device_id(), "zone@east");

        record.element_id = "legacy7".to_string();
        assert_eq!(record.device_id(), "legacy7");
    }
}
