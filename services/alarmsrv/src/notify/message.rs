//! Per-channel alarm message rendering

use chrono::{DateTime, Utc};

use crate::domain::{AlarmRecord, Origin, PointKind, Priority};

pub const UNMAPPED_FLOOR: &str = "Unmapped floor";

const EMAIL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px; background: #f9f9f9;">
    <div style="background: {{PRIORITY_COLOR}}; color: white; padding: 15px; border-radius: 5px 5px 0 0;">
      <h2 style="margin: 0;">Fire alarm detected</h2>
    </div>
    <div style="background: white; padding: 20px; border-radius: 0 0 5px 5px;">
      <p><strong>Priority:</strong> <span style="color: {{PRIORITY_COLOR}}; font-weight: bold;">{{PRIORITY}}</span></p>
      <p><strong>Building:</strong> {{BUILDING}}</p>
      <p><strong>Floor:</strong> {{FLOOR}}</p>
      <p><strong>Location:</strong> {{LOCATION}}</p>
      <p><strong>Description:</strong> {{DESCRIPTION}}</p>
      <p><strong>Origin:</strong> {{ORIGIN}}</p>
      <p><strong>Time:</strong> {{TIMESTAMP}}</p>
    </div>
  </div>
</body>
</html>
"#;

/// Escape text for HTML bodies and Telegram HTML captions
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Alarm with building and floor names resolved
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmMessage {
    pub priority: Priority,
    pub building: String,
    /// `None` when the alarm has no floor mapping
    pub floor: Option<String>,
    pub location: String,
    pub description: String,
    pub origin: Origin,
    pub kind: PointKind,
    pub element_id: String,
    pub started_at: DateTime<Utc>,
}

impl AlarmMessage {
    pub fn new(record: &AlarmRecord, building: Option<String>, floor: Option<String>) -> Self {
        let floor = record
            .floor
            .floor_id()
            .map(|id| floor.unwrap_or_else(|| format!("Floor {id}")));
        Self {
            priority: Priority::classify(record.origin),
            building: building.unwrap_or_else(|| format!("Building {}", record.building_id)),
            floor,
            location: record.location.clone().unwrap_or_else(|| "N/A".to_string()),
            description: record.description.clone(),
            origin: record.origin,
            kind: record.kind,
            element_id: record.element_id.clone(),
            started_at: record.started_at,
        }
    }

    pub fn floor_label(&self) -> &str {
        self.floor.as_deref().unwrap_or(UNMAPPED_FLOOR)
    }

    fn timestamp(&self) -> String {
        self.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    pub fn subject(&self) -> String {
        format!("Fire alarm - {} - {}", self.priority, self.building)
    }

    pub fn email_html(&self) -> String {
        EMAIL_TEMPLATE
            .replace("{{PRIORITY_COLOR}}", self.priority.color())
            .replace("{{PRIORITY}}", self.priority.as_str())
            .replace("{{BUILDING}}", &escape_html(&self.building))
            .replace("{{FLOOR}}", &escape_html(self.floor_label()))
            .replace("{{LOCATION}}", &escape_html(&self.location))
            .replace("{{DESCRIPTION}}", &escape_html(&self.description))
            .replace("{{ORIGIN}}", self.origin.as_str())
            .replace("{{TIMESTAMP}}", &self.timestamp())
    }

    /// Plain text; the floor prefix is left out for unmapped alarms
    pub fn sms_text(&self) -> String {
        let floor = self
            .floor
            .as_deref()
            .map(|f| format!("{f} - "))
            .unwrap_or_default();
        format!(
            "FIRE ALARM [{}]\nBuilding: {}\nLocation: {}{}\nDesc: {}",
            self.priority, self.building, floor, self.location, self.description
        )
    }

    /// Caption for `parse_mode=HTML`
    pub fn telegram_caption(&self) -> String {
        format!(
            "<b>FIRE ALARM DETECTED</b>\n\
             <b>Priority:</b> {}\n\
             <b>Building:</b> {}\n\
             <b>Floor:</b> {}\n\
             <b>Element:</b> {} {}\n\
             <b>Location:</b> {}\n\
             <b>Description:</b> {}\n\
             <b>Time:</b> {}",
            self.priority,
            escape_html(&self.building),
            escape_html(self.floor_label()),
            self.kind.as_str().to_uppercase(),
            escape_html(&self.element_id),
            escape_html(&self.location),
            escape_html(&self.description),
            self.timestamp(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::domain::{AlarmStatus, FloorAssignment};
    use chrono::TimeZone;

    fn record(origin: Origin, floor: FloorAssignment) -> AlarmRecord {
        AlarmRecord {
            id: 7,
            element_id: "det1@B1".to_string(),
            kind: PointKind::Detector,
            building_id: 1,
            floor,
            location: Some("Lobby <east>".to_string()),
            description: "Alarm Lobby & stairs".to_string(),
            status: AlarmStatus::Active,
            origin,
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            ended_at: None,
        }
    }

    #[test]
    fn test_email_rendering() {
        let msg = AlarmMessage::new(
            &record(Origin::Real, FloorAssignment::Mapped(10)),
            Some("HQ".to_string()),
            Some("Ground".to_string()),
        );
        assert_eq!(msg.subject(), "Fire alarm - CRITICAL - HQ");

        let html = msg.email_html();
        assert!(html.contains("#dc2626"));
        assert!(html.contains(">CRITICAL<"));
        assert!(html.contains("Lobby &lt;east&gt;"));
        assert!(html.contains("Alarm Lobby &amp; stairs"));
        assert!(html.contains("2024-03-01 12:30:00 UTC"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn test_sms_text() {
        let msg = AlarmMessage::new(
            &record(Origin::Real, FloorAssignment::Mapped(10)),
            Some("HQ".to_string()),
            Some("Ground".to_string()),
        );
        assert_eq!(
            msg.sms_text(),
            "FIRE ALARM [CRITICAL]\nBuilding: HQ\nLocation: Ground - Lobby <east>\nDesc: Alarm Lobby & stairs"
        );

        let unmapped = AlarmMessage::new(
            &record(Origin::Simulated, FloorAssignment::Unmapped),
            None,
            None,
        );
        assert_eq!(
            unmapped.sms_text(),
            "FIRE ALARM [NORMAL]\nBuilding: Building 1\nLocation: Lobby <east>\nDesc: Alarm Lobby & stairs"
        );
    }

    #[test]
    fn test_unmapped_floor_label() {
        let msg = AlarmMessage::new(&record(Origin::Test, FloorAssignment::Unmapped), None, None);
        assert_eq!(msg.floor_label(), UNMAPPED_FLOOR);
        assert!(msg.telegram_caption().contains("<b>Floor:</b> Unmapped floor"));
        assert!(msg.email_html().contains("#f59e0b"));

        let nameless =
            AlarmMessage::new(&record(Origin::Real, FloorAssignment::Mapped(4)), None, None);
        assert_eq!(nameless.floor_label(), "Floor 4");
    }

    #[test]
    fn test_telegram_caption_escapes() {
        let msg = AlarmMessage::new(
            &record(Origin::Real, FloorAssignment::Mapped(10)),
            Some("R&D".to_string()),
            Some("Ground".to_string()),
        );
        let caption = msg.telegram_caption();
        assert!(caption.starts_with("<b>FIRE ALARM DETECTED</b>\n"));
        assert!(caption.contains("<b>Building:</b> R&amp;D"));
        assert!(caption.contains("<b>Element:</b> DETECTOR det1@B1"));
    }
}
