use common::{Row, StoreResult};
use serde::Serialize;

use super::types::{Channel, Priority};

/// Notification recipient, maintained by the administration layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub enabled: bool,
    pub notify_email: bool,
    pub notify_sms: bool,
    pub notify_telegram: bool,
    pub sms_critical_only: bool,
}

impl Recipient {
    pub fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            name: row.opt_string("name").unwrap_or_default(),
            email: row.opt_string("email"),
            phone: row.opt_string("phone"),
            telegram_chat_id: row.opt_string("telegram_chat_id"),
            enabled: row.flag("enabled", true),
            notify_email: row.flag("notify_email", true),
            notify_sms: row.flag("notify_sms", false),
            notify_telegram: row.flag("notify_telegram", false),
            sms_critical_only: row.flag("sms_critical_only", true),
        })
    }

    /// Whether the recipient opted into `channel` for an alarm of `priority`
    pub fn wants(&self, channel: Channel, priority: Priority) -> bool {
        match channel {
            Channel::Email => self.notify_email,
            Channel::Sms => {
                self.notify_sms && (priority == Priority::Critical || !self.sms_critical_only)
            },
            Channel::Telegram => self.notify_telegram,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use common::SqlValue;

    #[test]
    fn test_from_row_applies_column_defaults() {
        let mut row = Row::new();
        row.insert("id", SqlValue::Integer(3));
        row.insert("name", SqlValue::from("Duty officer"));
        row.insert("email", SqlValue::from(""));
        row.insert("phone", SqlValue::from("+34600000000"));
        let recipient = Recipient::from_row(&row).unwrap();

        assert_eq!(recipient.email, None);
        assert!(recipient.enabled);
        assert!(recipient.notify_email);
        assert!(!recipient.notify_sms);
        assert!(recipient.sms_critical_only);
    }

    #[test]
    fn test_sms_critical_only() {
        let mut row = Row::new();
        row.insert("id", SqlValue::Integer(1));
        row.insert("notify_sms", SqlValue::Integer(1));
        let recipient = Recipient::from_row(&row).unwrap();

        assert!(recipient.wants(Channel::Sms, Priority::Critical));
        assert!(!recipient.wants(Channel::Sms, Priority::Normal));
    }
}
