//! Alarm service configuration
//!
//! Loaded with figment: serde defaults, then the YAML file, then `IGNIS_*`
//! environment variables (`__` separates nested keys).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::config_loader::load_config;
use common::logging::LogConfig;
use errors::{IgnisError, IgnisResult};
use ignis_protocols::bacnet::{BacnetPoint, BacnetTarget};
use ignis_protocols::modbus::{constants, ModbusTarget, ReadMapping};
use serde::{Deserialize, Serialize};

use crate::bus::SinkKind;
use crate::domain::{building_site_id, Origin, PointKind};
use crate::evidence::CaptureOptions;
use crate::notify::NotificationSettings;
use crate::poller::SiteSpec;

pub const ENV_PREFIX: &str = "IGNIS_";
pub const DEFAULT_CONFIG_PATH: &str = "config/alarmsrv.yaml";

/// Alarm service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub modbus: ModbusConfig,
    pub bacnet: BacnetConfig,
    pub notifications: NotificationConfig,
    pub evidence: EvidenceConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log: LogConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "alarmsrv".to_string(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://data/ignis.db`
    pub url: String,
    pub max_connections: u32,
    /// Create missing reference tables at startup
    pub ensure_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/ignis.db".to_string(),
            max_connections: 10,
            ensure_schema: true,
        }
    }
}

// ============================================================================
// Fieldbus
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub unit_id: u8,
    /// Also poll every building row that has a `modbus_ip`
    pub load_sites_from_store: bool,
    pub sites: Vec<ModbusSiteConfig>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconnect_delay_ms: 10_000,
            request_timeout_ms: 2000,
            unit_id: constants::DEFAULT_UNIT_ID,
            load_sites_from_store: false,
            sites: Vec::new(),
        }
    }
}

impl ModbusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One read block plus the kind of the points it carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(flatten)]
    pub mapping: ReadMapping,
    #[serde(default)]
    pub kind: PointKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSiteConfig {
    /// Defaults to `B{building_id}`
    #[serde(default)]
    pub site_id: Option<String>,
    pub building_id: i64,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default)]
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Defaults to SIMULATED for loopback hosts, REAL otherwise
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub read_mappings: Vec<MappingConfig>,
}

fn default_modbus_port() -> u16 {
    constants::DEFAULT_PORT
}

impl ModbusSiteConfig {
    pub fn site_id(&self) -> String {
        self.site_id
            .clone()
            .unwrap_or_else(|| building_site_id(self.building_id))
    }

    pub fn origin(&self) -> Origin {
        self.origin.unwrap_or_else(|| Origin::for_host(&self.host))
    }

    pub fn to_spec(&self, defaults: &ModbusConfig) -> SiteSpec<ModbusTarget> {
        let kinds = self
            .read_mappings
            .iter()
            .flat_map(|m| m.mapping.names.iter().map(|name| (name.clone(), m.kind)))
            .collect();

        SiteSpec {
            site_id: self.site_id(),
            building_id: self.building_id,
            origin: self.origin(),
            poll_interval: self
                .poll_interval_ms
                .map_or_else(|| defaults.poll_interval(), Duration::from_millis),
            reconnect_delay: defaults.reconnect_delay(),
            kinds,
            target: ModbusTarget {
                host: self.host.clone(),
                port: self.port,
                unit_id: self.unit_id.unwrap_or(defaults.unit_id),
                timeout: defaults.request_timeout(),
                mappings: self.read_mappings.iter().map(|m| m.mapping.clone()).collect(),
            },
        }
    }
}

// ============================================================================
// Building automation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacnetConfig {
    pub enabled: bool,
    pub local_port: u16,
    pub broadcast_address: String,
    pub discovery_interval_ms: u64,
    pub apdu_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub sites: Vec<BacnetSiteConfig>,
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_port: ignis_protocols::bacnet::DEFAULT_LOCAL_PORT,
            broadcast_address: "255.255.255.255:47808".to_string(),
            discovery_interval_ms: 10_000,
            apdu_timeout_ms: 6000,
            poll_interval_ms: 3000,
            reconnect_delay_ms: 10_000,
            sites: Vec::new(),
        }
    }
}

impl BacnetConfig {
    pub fn broadcast_addr(&self) -> IgnisResult<SocketAddr> {
        self.broadcast_address.parse().map_err(|e| {
            IgnisError::invalid_config("bacnet.broadcast_address", format!("{e}"))
        })
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetPointConfig {
    #[serde(flatten)]
    pub point: BacnetPoint,
    #[serde(default)]
    pub kind: PointKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacnetSiteConfig {
    #[serde(default)]
    pub site_id: Option<String>,
    pub building_id: i64,
    pub host: String,
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    #[serde(default)]
    pub device_instance: Option<u32>,
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub points: Vec<BacnetPointConfig>,
}

fn default_bacnet_port() -> u16 {
    ignis_protocols::bacnet::DEFAULT_DEVICE_PORT
}

impl BacnetSiteConfig {
    pub fn site_id(&self) -> String {
        self.site_id
            .clone()
            .unwrap_or_else(|| building_site_id(self.building_id))
    }

    pub fn to_spec(&self, defaults: &BacnetConfig) -> SiteSpec<BacnetTarget> {
        let kinds: HashMap<_, _> = self
            .points
            .iter()
            .map(|p| (p.point.name.clone(), p.kind))
            .collect();

        SiteSpec {
            site_id: self.site_id(),
            building_id: self.building_id,
            origin: self.origin.unwrap_or_else(|| Origin::for_host(&self.host)),
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
            reconnect_delay: Duration::from_millis(defaults.reconnect_delay_ms),
            kinds,
            target: BacnetTarget {
                host: self.host.clone(),
                port: self.port,
                device_instance: self.device_instance,
                points: self.points.iter().map(|p| p.point.clone()).collect(),
            },
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub notify_origins: Vec<Origin>,
    pub http_timeout_ms: u64,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub telegram: TelegramConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notify_origins: vec![Origin::Real],
            http_timeout_ms: 10_000,
            email: EmailConfig::default(),
            sms: SmsConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl NotificationConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn settings(&self) -> NotificationSettings {
        NotificationSettings {
            notify_origins: self.notify_origins.clone(),
            email_enabled: self.email.enabled,
            sms_enabled: self.sms.enabled,
            telegram_enabled: self.telegram.enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            from: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub from_number: String,
    pub api_base: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            api_base: "https://api.twilio.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub bot_token: String,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

// ============================================================================
// Evidence and events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    /// Origin serving `map_renderer.html`
    pub base_url: String,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub navigation_timeout_ms: u64,
    pub render_timeout_ms: u64,
    pub jpeg_quality: u8,
    pub chrome_executable: Option<PathBuf>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:3000".to_string(),
            width: 800,
            height: 600,
            scale: 2.0,
            navigation_timeout_ms: 10_000,
            render_timeout_ms: 5000,
            jpeg_quality: 80,
            chrome_executable: None,
        }
    }
}

impl EvidenceConfig {
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            width: self.width,
            height: self.height,
            scale: self.scale,
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
            render_timeout: Duration::from_millis(self.render_timeout_ms),
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub sink: SinkKind,
    pub redis_url: String,
    pub channel_prefix: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "ignis".to_string(),
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl AppConfig {
    /// Site id of each building with a configured field site
    ///
    /// A Modbus site wins over a BACnet one for the same building.
    pub fn site_ids(&self) -> HashMap<i64, String> {
        let mut ids = HashMap::new();
        let modbus = self
            .modbus
            .sites
            .iter()
            .map(|s| (s.building_id, s.site_id()));
        let bacnet = self
            .bacnet
            .sites
            .iter()
            .map(|s| (s.building_id, s.site_id()));
        for (building_id, site_id) in modbus.chain(bacnet) {
            ids.entry(building_id).or_insert(site_id);
        }
        ids
    }

    /// Load from file and environment, then validate
    pub fn load(path: impl AsRef<Path>) -> IgnisResult<Self> {
        let config: Self = load_config(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IgnisResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(IgnisError::invalid_config("database.url", "empty"));
        }
        if self.modbus.poll_interval_ms == 0 || self.bacnet.poll_interval_ms == 0 {
            return Err(IgnisError::invalid_config("poll_interval_ms", "must be > 0"));
        }

        let mut site_ids = HashSet::new();
        for (idx, site) in self.modbus.sites.iter().enumerate() {
            let field = format!("modbus.sites[{idx}]");
            if site.host.trim().is_empty() {
                return Err(IgnisError::invalid_config(field, "host is empty"));
            }
            if site.poll_interval_ms == Some(0) {
                return Err(IgnisError::invalid_config(field, "poll_interval_ms must be > 0"));
            }
            for mapping in &site.read_mappings {
                mapping
                    .mapping
                    .validate()
                    .map_err(|e| IgnisError::invalid_config(field.clone(), e.to_string()))?;
            }
            if !site_ids.insert(site.site_id()) {
                return Err(IgnisError::invalid_config(
                    field,
                    format!("duplicate site id {}", site.site_id()),
                ));
            }
        }

        if self.bacnet.enabled {
            self.bacnet.broadcast_addr()?;
        }
        for (idx, site) in self.bacnet.sites.iter().enumerate() {
            let field = format!("bacnet.sites[{idx}]");
            if site.host.trim().is_empty() {
                return Err(IgnisError::invalid_config(field, "host is empty"));
            }
            if site.points.is_empty() {
                return Err(IgnisError::invalid_config(field, "no points"));
            }
            let mut names = HashSet::new();
            if let Some(dup) = site.points.iter().find(|p| !names.insert(&p.point.name)) {
                return Err(IgnisError::invalid_config(
                    field,
                    format!("duplicate point {}", dup.point.name),
                ));
            }
            if !site_ids.insert(site.site_id()) {
                return Err(IgnisError::invalid_config(
                    field,
                    format!("duplicate site id {}", site.site_id()),
                ));
            }
        }

        let n = &self.notifications;
        if n.email.enabled && (n.email.smtp_host.is_empty() || n.email.from.is_empty()) {
            return Err(IgnisError::invalid_config(
                "notifications.email",
                "smtp_host and from are required",
            ));
        }
        if n.sms.enabled
            && (n.sms.account_sid.is_empty()
                || n.sms.auth_token.is_empty()
                || n.sms.from_number.is_empty())
        {
            return Err(IgnisError::invalid_config(
                "notifications.sms",
                "account_sid, auth_token and from_number are required",
            ));
        }
        if n.telegram.enabled && n.telegram.bot_token.is_empty() {
            return Err(IgnisError::invalid_config(
                "notifications.telegram",
                "bot_token is required",
            ));
        }

        let e = &self.evidence;
        if !(1..=100).contains(&e.jpeg_quality) {
            return Err(IgnisError::invalid_config(
                "evidence.jpeg_quality",
                "must be within 1..=100",
            ));
        }
        if e.width == 0 || e.height == 0 || e.scale <= 0.0 {
            return Err(IgnisError::invalid_config(
                "evidence",
                "viewport must be positive",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use ignis_protocols::modbus::RegionKind;
    use std::io::Write;

    const SAMPLE: &str = r#"
database:
  url: "sqlite::memory:"
modbus:
  poll_interval_ms: 500
  sites:
    - building_id: 1
      host: 10.0.0.20
      read_mappings:
        - type: DiscreteInputs
          address: 0
          count: 2
          names: [det1, det2]
          kind: detector
        - type: Coils
          address: 8
          count: 1
          names: [fault]
          kind: status
    - site_id: lab
      building_id: 2
      host: 127.0.0.1
      port: 5020
      poll_interval_ms: 250
notifications:
  notify_origins: [REAL, TEST]
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.modbus.reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.bacnet.poll_interval_ms, 3000);
        assert_eq!(config.notifications.notify_origins, vec![Origin::Real]);
        assert_eq!(config.evidence.jpeg_quality, 80);
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.modbus.sites.len(), 2);
        let site = &config.modbus.sites[0];
        assert_eq!(site.site_id(), "B1");
        assert_eq!(site.port, 502);
        assert_eq!(site.origin(), Origin::Real);
        assert_eq!(site.read_mappings[0].mapping.region, RegionKind::DiscreteInputs);

        let lab = &config.modbus.sites[1];
        assert_eq!(lab.site_id(), "lab");
        assert_eq!(lab.origin(), Origin::Simulated);
        assert_eq!(
            config.notifications.notify_origins,
            vec![Origin::Real, Origin::Test]
        );
    }

    #[test]
    fn test_site_spec_conversion() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load(file.path()).unwrap();

        let spec = config.modbus.sites[0].to_spec(&config.modbus);
        assert_eq!(spec.poll_interval, Duration::from_millis(500));
        assert_eq!(spec.kind_of("det2"), PointKind::Detector);
        assert_eq!(spec.kind_of("fault"), PointKind::Status);
        assert_eq!(spec.kind_of("unlisted"), PointKind::BinaryAlarm);
        assert_eq!(spec.target.mappings.len(), 2);
        assert_eq!(spec.target.timeout, Duration::from_millis(2000));

        let lab = config.modbus.sites[1].to_spec(&config.modbus);
        assert_eq!(lab.poll_interval, Duration::from_millis(250));
        assert!(lab.target.mappings.is_empty());
    }

    #[test]
    fn test_site_ids_by_building() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load(file.path()).unwrap();

        let ids = config.site_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[&1], "B1");
        assert_eq!(ids[&2], "lab");
    }

    #[test]
    fn test_rejects_bad_mapping() {
        let file = write_config(
            r#"
modbus:
  sites:
    - building_id: 1
      host: 10.0.0.20
      read_mappings:
        - type: DiscreteInputs
          address: 0
          count: 3
          names: [det1]
"#,
        );
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("modbus.sites[0]"));
    }

    #[test]
    fn test_rejects_duplicate_site_ids() {
        let mut config = AppConfig::default();
        let site = ModbusSiteConfig {
            site_id: None,
            building_id: 4,
            host: "10.0.0.4".to_string(),
            port: 502,
            unit_id: None,
            poll_interval_ms: None,
            origin: None,
            read_mappings: Vec::new(),
        };
        config.modbus.sites = vec![site.clone(), site];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_channel_requires_credentials() {
        let mut config = AppConfig::default();
        config.notifications.telegram.enabled = true;
        assert!(config.validate().is_err());
        config.notifications.telegram.bot_token = "123:abc".to_string();
        config.validate().unwrap();
    }
}
