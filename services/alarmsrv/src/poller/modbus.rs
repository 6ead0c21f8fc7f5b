//! Fieldbus poller and store-backed site discovery

use std::collections::HashMap;
use std::time::Duration;

use common::{params, DataStore};
use errors::IgnisResult;
use ignis_protocols::modbus::{constants, ModbusAdapter, ModbusTarget, ReadMapping};
use serde::Deserialize;
use tracing::{info, warn};

use super::{SitePoller, SiteSpec};
use crate::config::ModbusConfig;
use crate::domain::{building_site_id, Origin, PointKind};

pub type ModbusPoller = SitePoller<ModbusAdapter>;

/// `buildings.modbus_config` document
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredModbusConfig {
    polling_interval: Option<u64>,
    unit_id: Option<u8>,
    #[serde(default)]
    read_mappings: Vec<ReadMapping>,
}

/// Point kinds of a building's devices, keyed by device id
///
/// Devices that never raise alarms (cameras, panels, unknown types) are
/// recorded as status points so their edges are ignored.
pub async fn device_kinds(
    store: &dyn DataStore,
    building_id: i64,
) -> IgnisResult<HashMap<String, PointKind>> {
    let rows = store
        .query(
            "SELECT d.device_id, d.type FROM devices d \
             JOIN floors f ON f.id = d.floor_id WHERE f.building_id = ?",
            &params![building_id],
        )
        .await?;

    let mut kinds = HashMap::new();
    for row in rows {
        let device_id = row.string("device_id")?;
        let device_type = row.opt_string("type").unwrap_or_default();
        let kind = PointKind::from_device_type(&device_type).unwrap_or(PointKind::Status);
        kinds.insert(device_id, kind);
    }
    Ok(kinds)
}

/// Site specs for every building row with a fieldbus address
pub async fn load_store_sites(
    store: &dyn DataStore,
    defaults: &ModbusConfig,
) -> IgnisResult<Vec<SiteSpec<ModbusTarget>>> {
    let rows = store
        .query(
            "SELECT id, modbus_ip, modbus_port, modbus_config FROM buildings \
             WHERE modbus_ip IS NOT NULL AND TRIM(modbus_ip) != '' ORDER BY id",
            &[],
        )
        .await?;

    let mut specs = Vec::with_capacity(rows.len());
    for row in rows {
        let building_id = row.i64("id")?;
        let host = row.string("modbus_ip")?.trim().to_string();
        let port = row
            .opt_i64("modbus_port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(constants::DEFAULT_PORT);

        let stored: StoredModbusConfig = match row.opt_string("modbus_config") {
            Some(text) => match serde_json::from_str(&text) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("Building {} modbus_config ignored: {}", building_id, e);
                    StoredModbusConfig::default()
                },
            },
            None => StoredModbusConfig::default(),
        };

        let mut mappings = Vec::with_capacity(stored.read_mappings.len());
        for mapping in stored.read_mappings {
            match mapping.validate() {
                Ok(()) => mappings.push(mapping),
                Err(e) => warn!("Building {} mapping skipped: {}", building_id, e),
            }
        }

        specs.push(SiteSpec {
            site_id: building_site_id(building_id),
            building_id,
            origin: Origin::for_host(&host),
            poll_interval: stored
                .polling_interval
                .filter(|ms| *ms > 0)
                .map_or_else(|| defaults.poll_interval(), Duration::from_millis),
            reconnect_delay: defaults.reconnect_delay(),
            kinds: device_kinds(store, building_id).await?,
            target: ModbusTarget {
                host,
                port,
                unit_id: stored.unit_id.unwrap_or(defaults.unit_id),
                timeout: defaults.request_timeout(),
                mappings,
            },
        });
    }
    Ok(specs)
}

impl SitePoller<ModbusAdapter> {
    /// Connect configured sites
    pub async fn start(&mut self, config: &ModbusConfig) {
        for site in &config.sites {
            self.connect_site(site.to_spec(config)).await;
        }
    }

    /// Connect every building in the store that has a fieldbus address
    pub async fn start_from_store(
        &mut self,
        store: &dyn DataStore,
        defaults: &ModbusConfig,
    ) -> IgnisResult<usize> {
        let specs = load_store_sites(store, defaults).await?;
        let count = specs.len();
        for spec in specs {
            self.connect_site(spec).await;
        }
        info!("Modbus: {} sites from store", count);
        Ok(count)
    }
}
