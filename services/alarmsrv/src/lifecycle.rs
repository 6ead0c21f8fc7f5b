//! Alarm lifecycle
//!
//! Turns signal edges into ACTIVE / RESOLVED alarm records. Edges are
//! consumed by a single task, so two edges for the same element are never
//! handled concurrently; the partial unique index on active alerts guards
//! the same invariant at the storage layer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use common::{params, DataStore, Row, StoreTransaction};
use errors::{log_error, IgnisResult};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{topics, EventSink};
use crate::domain::{
    building_site_id, element_id, AlarmEvent, AlarmRecord, AlarmStatus, FloorAssignment,
    Origin, PointKind, SignalChanged,
};

const SELECT_ACTIVE: &str =
    "SELECT * FROM alerts WHERE element_id = ? AND status = 'ACTIVE' LIMIT 1";

const INSERT_ALERT: &str = "INSERT INTO alerts \
     (element_id, type, building_id, floor_id, location, description, status, origin, started_at) \
     VALUES (?, ?, ?, ?, ?, ?, 'ACTIVE', ?, ?)";

const INSERT_HISTORY: &str = "INSERT INTO events \
     (device_id, type, message, value, origin, building_id, floor_id, timestamp) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_DEVICE: &str = "SELECT d.floor_id, d.location, d.name, d.type FROM devices d \
     JOIN floors f ON f.id = d.floor_id \
     WHERE f.building_id = ? AND d.device_id = ? LIMIT 1";

const SELECT_BUILDING_DEVICES: &str = "SELECT d.device_id, d.type, d.floor_id, d.location, d.name \
     FROM devices d JOIN floors f ON f.id = d.floor_id \
     WHERE f.building_id = ? ORDER BY d.id";

/// What a signal edge did
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleOutcome {
    /// Point kind never raises alarms
    Ignored,
    Opened(AlarmRecord),
    /// Rising edge for an element that already has an ACTIVE alarm
    AlreadyActive,
    Closed(AlarmRecord),
    /// Falling edge with no ACTIVE alarm
    NotActive,
}

/// History row written next to every alarm transition
struct HistoryEntry<'a> {
    record: &'a AlarmRecord,
    raised: bool,
}

impl HistoryEntry<'_> {
    fn kind(&self) -> &'static str {
        if self.raised {
            "ALARM"
        } else {
            "ALARM_CLEARED"
        }
    }

    fn value(&self) -> &'static str {
        if self.raised {
            "ON"
        } else {
            "OFF"
        }
    }

    fn message(&self) -> String {
        let r = self.record;
        if self.raised {
            match &r.location {
                Some(location) => format!("{} - {}", r.description, location),
                None => r.description.clone(),
            }
        } else {
            format!("{} cleared", r.description)
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        if self.raised {
            self.record.started_at
        } else {
            self.record.ended_at.unwrap_or(self.record.started_at)
        }
    }

    fn params(&self) -> Vec<common::SqlValue> {
        let r = self.record;
        params![
            r.element_id.as_str(),
            self.kind(),
            self.message(),
            self.value(),
            r.origin.as_str(),
            r.building_id,
            r.floor.floor_id(),
            self.timestamp(),
        ]
    }

    fn payload(&self, id: i64) -> serde_json::Value {
        let r = self.record;
        json!({
            "id": id,
            "device_id": r.element_id,
            "type": self.kind(),
            "message": self.message(),
            "value": self.value(),
            "origin": r.origin.as_str(),
            "building_id": r.building_id,
            "floor_id": r.floor.floor_id(),
            "timestamp": self.timestamp().to_rfc3339(),
        })
    }
}

/// Stored timestamps carry millisecond precision
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn insert_params(record: &AlarmRecord) -> Vec<common::SqlValue> {
    params![
        record.element_id.as_str(),
        record.kind.as_str(),
        record.building_id,
        record.floor.floor_id(),
        record.location.clone(),
        record.description.as_str(),
        record.origin.as_str(),
        record.started_at,
    ]
}

pub struct AlarmLifecycleManager {
    store: Arc<dyn DataStore>,
    sink: Arc<dyn EventSink>,
    alarms: mpsc::UnboundedSender<AlarmEvent>,
    /// Configured site ids; other buildings use `B{id}`
    site_ids: HashMap<i64, String>,
}

impl AlarmLifecycleManager {
    pub fn new(
        store: Arc<dyn DataStore>,
        sink: Arc<dyn EventSink>,
        alarms: mpsc::UnboundedSender<AlarmEvent>,
    ) -> Self {
        Self {
            store,
            sink,
            alarms,
            site_ids: HashMap::new(),
        }
    }

    /// Drill alarms carry the same site id as the building's poller
    pub fn with_site_ids(mut self, site_ids: HashMap<i64, String>) -> Self {
        self.site_ids = site_ids;
        self
    }

    fn site_id(&self, building_id: i64) -> String {
        self.site_ids
            .get(&building_id)
            .cloned()
            .unwrap_or_else(|| building_site_id(building_id))
    }

    /// Consume signal edges one at a time until every sender is gone
    pub fn spawn(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SignalChanged>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = signals.recv().await {
                if let Err(e) = self.on_signal_changed(&event).await {
                    log_error!(
                        e,
                        "Signal {}={} not persisted",
                        event.element_id(),
                        event.value
                    );
                }
            }
            info!("Lifecycle consumer stopped");
        })
    }

    pub async fn on_signal_changed(&self, event: &SignalChanged) -> IgnisResult<LifecycleOutcome> {
        if !event.kind.is_alarm_relevant() {
            debug!("{} is {}, ignored", event.element_id(), event.kind);
            return Ok(LifecycleOutcome::Ignored);
        }
        if event.value {
            self.open(event).await
        } else {
            self.close(event).await
        }
    }

    async fn open(&self, event: &SignalChanged) -> IgnisResult<LifecycleOutcome> {
        let element_id = event.element_id();
        if self
            .store
            .get(SELECT_ACTIVE, &params![element_id.as_str()])
            .await?
            .is_some()
        {
            debug!("Alarm {} already active", element_id);
            return Ok(LifecycleOutcome::AlreadyActive);
        }

        let device = self
            .store
            .get(SELECT_DEVICE, &params![event.building_id, event.point_id.as_str()])
            .await?;
        let (kind, floor, location, name) = match &device {
            Some(row) => {
                let kind = row
                    .opt_string("type")
                    .and_then(|t| PointKind::from_device_type(&t))
                    .filter(PointKind::is_alarm_relevant);
                let Some(kind) = kind else {
                    debug!("{} is not an alarm device, ignored", element_id);
                    return Ok(LifecycleOutcome::Ignored);
                };
                (
                    kind,
                    FloorAssignment::from(row.opt_i64("floor_id")),
                    row.opt_string("location"),
                    row.opt_string("name"),
                )
            },
            None => (event.kind, FloorAssignment::Unmapped, None, None),
        };

        let mut record = AlarmRecord {
            id: 0,
            element_id,
            kind,
            building_id: event.building_id,
            floor,
            location: Some(
                location.unwrap_or_else(|| format!("{} addr {}", event.site_id, event.address)),
            ),
            description: name.map_or_else(|| event.description.clone(), |n| format!("Alarm {n}")),
            status: AlarmStatus::Active,
            origin: event.source,
            started_at: now(),
            ended_at: None,
        };

        record.id = match self.store.run(INSERT_ALERT, &insert_params(&record)).await {
            Ok(result) => result.insert_id,
            Err(e) if e.is_unique_violation() => {
                debug!("Alarm {} opened concurrently", record.element_id);
                return Ok(LifecycleOutcome::AlreadyActive);
            },
            Err(e) => return Err(e.into()),
        };

        if !record.floor.is_mapped() {
            warn!("Alarm {} has no floor mapping", record.element_id);
        }
        info!(
            "Alarm opened: {} #{} ({})",
            record.element_id, record.id, record.origin
        );

        self.append_history(&record, true).await;
        self.sink.emit(topics::ALARM_OPENED, record.to_payload()).await;
        self.forward(AlarmEvent::Opened(record.clone()));
        Ok(LifecycleOutcome::Opened(record))
    }

    async fn close(&self, event: &SignalChanged) -> IgnisResult<LifecycleOutcome> {
        let element_id = event.element_id();
        let Some(row) = self
            .store
            .get(SELECT_ACTIVE, &params![element_id.as_str()])
            .await?
        else {
            debug!("No active alarm for {}", element_id);
            return Ok(LifecycleOutcome::NotActive);
        };

        let mut record = AlarmRecord::from_row(&row)?;
        let ended_at = now().max(record.started_at);
        let result = self
            .store
            .run(
                "UPDATE alerts SET status = 'RESOLVED', ended_at = ? \
                 WHERE id = ? AND status = 'ACTIVE'",
                &params![ended_at, record.id],
            )
            .await?;
        if result.changes == 0 {
            return Ok(LifecycleOutcome::NotActive);
        }

        record.status = AlarmStatus::Resolved;
        record.ended_at = Some(ended_at);
        info!("Alarm closed: {} #{}", record.element_id, record.id);

        self.append_history(&record, false).await;
        self.sink.emit(topics::ALARM_CLOSED, record.to_payload()).await;
        self.forward(AlarmEvent::Closed(record.clone()));
        Ok(LifecycleOutcome::Closed(record))
    }

    /// History failures never undo the alarm transition
    async fn append_history(&self, record: &AlarmRecord, raised: bool) {
        let entry = HistoryEntry { record, raised };
        match self.store.run(INSERT_HISTORY, &entry.params()).await {
            Ok(result) => {
                self.sink
                    .emit(topics::HISTORY_NEW, entry.payload(result.insert_id))
                    .await;
            },
            Err(e) => warn!("History for {} not written: {}", record.element_id, e),
        }

        if !raised {
            if let Err(e) = self
                .store
                .run(
                    "UPDATE events SET resolved = 1 \
                     WHERE device_id = ? AND type = 'ALARM' AND resolved = 0",
                    &params![record.element_id.as_str()],
                )
                .await
            {
                warn!("History for {} not resolved: {}", record.element_id, e);
            }
        }
    }

    fn forward(&self, event: AlarmEvent) {
        if self.alarms.send(event).is_err() {
            debug!("Dispatcher gone, alarm event dropped");
        }
    }

    /// Open an alarm for every alarm-relevant device of a building
    ///
    /// All-or-nothing: rows are written in one transaction and events are
    /// emitted only after commit.
    pub async fn raise_building_drill(
        &self,
        building_id: i64,
        origin: Origin,
    ) -> IgnisResult<Vec<AlarmRecord>> {
        let site_id = self.site_id(building_id);
        let mut tx = self.store.begin().await?;
        let opened = match open_drill_alarms(tx.as_mut(), building_id, &site_id, origin).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Drill rollback failed: {}", rollback);
                }
                warn!("Drill for building {} aborted: {}", building_id, e);
                return Err(e);
            },
        };
        tx.commit().await?;

        info!(
            "Drill on building {}: {} alarms ({})",
            building_id,
            opened.len(),
            origin
        );
        for (record, history_id) in &opened {
            self.sink.emit(topics::ALARM_OPENED, record.to_payload()).await;
            let entry = HistoryEntry {
                record,
                raised: true,
            };
            self.sink
                .emit(topics::HISTORY_NEW, entry.payload(*history_id))
                .await;
        }

        let records: Vec<AlarmRecord> = opened.into_iter().map(|(record, _)| record).collect();
        if !records.is_empty() {
            self.forward(AlarmEvent::BulkOpened(records.clone()));
        }
        Ok(records)
    }

    /// Resolve every ACTIVE alarm that did not come from hardware
    pub async fn resolve_simulations(&self) -> IgnisResult<u64> {
        let resolved_at = now();
        let result = self
            .store
            .run(
                "UPDATE alerts SET status = 'RESOLVED', ended_at = MAX(?, started_at) \
                 WHERE status = 'ACTIVE' AND origin != 'REAL'",
                &params![resolved_at],
            )
            .await?;

        if let Err(e) = self
            .store
            .run(
                "UPDATE events SET resolved = 1 WHERE resolved = 0 AND origin != 'REAL'",
                &[],
            )
            .await
        {
            warn!("Simulated history not resolved: {}", e);
        }

        info!("Resolved {} simulated alarms", result.changes);
        self.sink
            .emit(
                topics::SIMULATION_RESOLVED,
                json!({
                    "count": result.changes,
                    "resolved_at": resolved_at.to_rfc3339(),
                }),
            )
            .await;
        Ok(result.changes)
    }
}

async fn open_drill_alarms(
    tx: &mut dyn StoreTransaction,
    building_id: i64,
    site_id: &str,
    origin: Origin,
) -> IgnisResult<Vec<(AlarmRecord, i64)>> {
    let devices = tx
        .query(SELECT_BUILDING_DEVICES, &params![building_id])
        .await?;
    let started_at = now();

    let mut opened = Vec::new();
    for row in devices {
        let Some(mut record) = drill_record(&row, site_id, building_id, origin, started_at)?
        else {
            continue;
        };
        if tx
            .get(SELECT_ACTIVE, &params![record.element_id.as_str()])
            .await?
            .is_some()
        {
            continue;
        }

        record.id = tx.run(INSERT_ALERT, &insert_params(&record)).await?.insert_id;
        let entry = HistoryEntry {
            record: &record,
            raised: true,
        };
        let history_id = tx.run(INSERT_HISTORY, &entry.params()).await?.insert_id;
        opened.push((record, history_id));
    }
    Ok(opened)
}

/// Unsaved record for a drill device; `None` for non-alarm devices
fn drill_record(
    row: &Row,
    site_id: &str,
    building_id: i64,
    origin: Origin,
    started_at: DateTime<Utc>,
) -> IgnisResult<Option<AlarmRecord>> {
    let device_id = row.string("device_id")?;
    let Some(kind) = row
        .opt_string("type")
        .and_then(|t| PointKind::from_device_type(&t))
        .filter(PointKind::is_alarm_relevant)
    else {
        return Ok(None);
    };
    let name = row.opt_string("name").unwrap_or_else(|| device_id.clone());

    Ok(Some(AlarmRecord {
        id: 0,
        element_id: element_id(&device_id, site_id),
        kind,
        building_id,
        floor: row.opt_i64("floor_id").into(),
        location: row.opt_string("location"),
        description: format!("Alarm {name}"),
        status: AlarmStatus::Active,
        origin,
        started_at,
        ended_at: None,
    }))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::{BroadcastSink, BusMessage};
    use common::sqlite::{ensure_schema, SqliteStore};
    use tokio::sync::broadcast;
    use tracing_test::traced_test;

    struct Fixture {
        store: Arc<SqliteStore>,
        manager: AlarmLifecycleManager,
        bus: broadcast::Receiver<BusMessage>,
        alarms: mpsc::UnboundedReceiver<AlarmEvent>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        ensure_schema(store.as_ref()).await.unwrap();
        store
            .exec(
                "INSERT INTO buildings (id, name) VALUES (1, 'HQ');
                 INSERT INTO floors (id, building_id, name) VALUES (10, 1, 'Ground'), (11, 1, 'First');
                 INSERT INTO devices (device_id, floor_id, type, name, location) VALUES
                     ('det1', 10, 'detector', 'Lobby detector', 'Lobby'),
                     ('pull1', 11, 'pulsador', 'Stair pull station', 'Stair B'),
                     ('cam1', 11, 'camera', 'Camera', 'Hall');",
            )
            .await
            .unwrap();

        let sink = BroadcastSink::new(64);
        let bus = sink.subscribe();
        let (tx, alarms) = mpsc::unbounded_channel();
        let manager = AlarmLifecycleManager::new(
            Arc::clone(&store) as Arc<dyn DataStore>,
            Arc::new(sink),
            tx,
        );
        Fixture {
            store,
            manager,
            bus,
            alarms,
        }
    }

    fn signal(point: &str, value: bool) -> SignalChanged {
        SignalChanged {
            site_id: "B1".to_string(),
            building_id: 1,
            point_id: point.to_string(),
            address: 4,
            value,
            source: Origin::Real,
            kind: PointKind::Detector,
            description: format!("Alarm {point}"),
            timestamp: Utc::now(),
        }
    }

    async fn active_count(store: &SqliteStore, element: &str) -> i64 {
        store
            .get(
                "SELECT COUNT(*) AS n FROM alerts WHERE element_id = ? AND status = 'ACTIVE'",
                &params![element],
            )
            .await
            .unwrap()
            .unwrap()
            .i64("n")
            .unwrap()
    }

    fn topics_seen(bus: &mut broadcast::Receiver<BusMessage>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(msg) = bus.try_recv() {
            seen.push(msg.topic);
        }
        seen
    }

    #[tokio::test]
    async fn test_rising_edge_opens_mapped_alarm() {
        let mut f = fixture().await;
        let outcome = f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();

        let LifecycleOutcome::Opened(record) = outcome else {
            panic!("expected open, got {outcome:?}");
        };
        assert_eq!(record.element_id, "det1@B1");
        assert_eq!(record.floor, FloorAssignment::Mapped(10));
        assert_eq!(record.location.as_deref(), Some("Lobby"));
        assert_eq!(record.description, "Alarm Lobby detector");
        assert_eq!(record.status, AlarmStatus::Active);
        assert!(record.id > 0);

        assert_eq!(topics_seen(&mut f.bus), vec!["event:new", "pci:alarm:on"]);
        assert!(matches!(f.alarms.try_recv().unwrap(), AlarmEvent::Opened(r) if r.id == record.id));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_point_is_unmapped() {
        let f = fixture().await;
        let outcome = f.manager.on_signal_changed(&signal("zone9", true)).await.unwrap();

        let LifecycleOutcome::Opened(record) = outcome else {
            panic!("expected open");
        };
        assert_eq!(record.floor, FloorAssignment::Unmapped);
        assert_eq!(record.location.as_deref(), Some("B1 addr 4"));

        let row = f
            .store
            .get("SELECT floor_id FROM alerts WHERE id = ?", &params![record.id])
            .await
            .unwrap()
            .unwrap();
        assert!(row.get("floor_id").unwrap().is_null());
        assert!(logs_contain("Alarm zone9@B1 has no floor mapping"));
    }

    #[tokio::test]
    async fn test_duplicate_rising_edge_is_noop() {
        let mut f = fixture().await;
        f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        let _ = topics_seen(&mut f.bus);
        let _ = f.alarms.try_recv();

        let second = f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        assert_eq!(second, LifecycleOutcome::AlreadyActive);
        assert_eq!(active_count(&f.store, "det1@B1").await, 1);
        assert!(topics_seen(&mut f.bus).is_empty());
        assert!(f.alarms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_falling_edge_without_open_alarm() {
        let mut f = fixture().await;
        let outcome = f.manager.on_signal_changed(&signal("det1", false)).await.unwrap();

        assert_eq!(outcome, LifecycleOutcome::NotActive);
        assert!(topics_seen(&mut f.bus).is_empty());
        assert!(f.alarms.try_recv().is_err());
        let rows = f.store.query("SELECT id FROM alerts", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_falling_edge_closes_alarm() {
        let mut f = fixture().await;
        f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        let _ = topics_seen(&mut f.bus);
        let _ = f.alarms.try_recv();

        let outcome = f.manager.on_signal_changed(&signal("det1", false)).await.unwrap();
        let LifecycleOutcome::Closed(record) = outcome else {
            panic!("expected close");
        };
        assert_eq!(record.status, AlarmStatus::Resolved);
        assert!(record.ended_at.unwrap() >= record.started_at);
        assert_eq!(active_count(&f.store, "det1@B1").await, 0);

        assert_eq!(topics_seen(&mut f.bus), vec!["event:new", "pci:alarm:off"]);
        assert!(matches!(f.alarms.try_recv().unwrap(), AlarmEvent::Closed(_)));

        let history = f
            .store
            .query("SELECT type, resolved FROM events ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].string("type").unwrap(), "ALARM");
        assert!(history[0].flag("resolved", false));
        assert_eq!(history[1].string("type").unwrap(), "ALARM_CLEARED");

        // A new rising edge opens a fresh alarm
        let reopened = f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        assert!(matches!(reopened, LifecycleOutcome::Opened(r) if r.id != record.id));
    }

    #[tokio::test]
    async fn test_status_points_are_ignored() {
        let f = fixture().await;
        let mut event = signal("fault", true);
        event.kind = PointKind::Status;
        let outcome = f.manager.on_signal_changed(&event).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_non_alarm_device_edge_is_ignored() {
        let mut f = fixture().await;
        f.store
            .exec(
                "INSERT INTO devices (device_id, floor_id, type, name) VALUES \
                 ('panel1', 10, 'central', 'Main panel')",
            )
            .await
            .unwrap();

        // Kind on the edge is what an unlisted point would carry
        let mut camera = signal("cam1", true);
        camera.kind = PointKind::BinaryAlarm;
        let outcome = f.manager.on_signal_changed(&camera).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::Ignored);

        let outcome = f.manager.on_signal_changed(&signal("panel1", true)).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::Ignored);

        let rows = f.store.query("SELECT id FROM alerts", &[]).await.unwrap();
        assert!(rows.is_empty());
        assert!(topics_seen(&mut f.bus).is_empty());
        assert!(f.alarms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_device_type_sets_alarm_kind() {
        let f = fixture().await;
        let mut pull = signal("pull1", true);
        pull.kind = PointKind::BinaryAlarm;
        let outcome = f.manager.on_signal_changed(&pull).await.unwrap();

        let LifecycleOutcome::Opened(record) = outcome else {
            panic!("expected open, got {outcome:?}");
        };
        assert_eq!(record.kind, PointKind::PullStation);
    }

    #[tokio::test]
    async fn test_persistence_failure_emits_nothing() {
        let mut f = fixture().await;
        f.store.exec("DROP TABLE alerts").await.unwrap();

        assert!(f.manager.on_signal_changed(&signal("det1", true)).await.is_err());
        assert!(topics_seen(&mut f.bus).is_empty());
        assert!(f.alarms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_building_drill_opens_relevant_devices() {
        let mut f = fixture().await;
        f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        let _ = topics_seen(&mut f.bus);
        let _ = f.alarms.try_recv();

        let records = f.manager.raise_building_drill(1, Origin::Test).await.unwrap();

        // det1 already active, cam1 is not an alarm device
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].element_id, "pull1@B1");
        assert_eq!(records[0].kind, PointKind::PullStation);
        assert_eq!(records[0].floor, FloorAssignment::Mapped(11));
        assert_eq!(records[0].origin, Origin::Test);

        assert_eq!(topics_seen(&mut f.bus), vec!["pci:alarm:on", "event:new"]);
        assert!(matches!(f.alarms.try_recv().unwrap(), AlarmEvent::BulkOpened(r) if r.len() == 1));
    }

    #[tokio::test]
    async fn test_building_drill_uses_configured_site_id() {
        let f = fixture().await;
        let manager = f
            .manager
            .with_site_ids(HashMap::from([(1, "HQ-PANEL".to_string())]));

        // A real edge from the configured poller
        let mut edge = signal("det1", true);
        edge.site_id = "HQ-PANEL".to_string();
        manager.on_signal_changed(&edge).await.unwrap();

        let records = manager.raise_building_drill(1, Origin::Test).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].element_id, "pull1@HQ-PANEL");
        assert_eq!(active_count(&f.store, "det1@HQ-PANEL").await, 1);
        assert_eq!(active_count(&f.store, "det1@B1").await, 0);
    }

    #[tokio::test]
    async fn test_building_drill_rolls_back() {
        let mut f = fixture().await;
        f.store.exec("DROP TABLE events").await.unwrap();

        assert!(f.manager.raise_building_drill(1, Origin::Test).await.is_err());
        let rows = f.store.query("SELECT id FROM alerts", &[]).await.unwrap();
        assert!(rows.is_empty());
        assert!(topics_seen(&mut f.bus).is_empty());
        assert!(f.alarms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_simulations() {
        let mut f = fixture().await;
        f.manager.on_signal_changed(&signal("det1", true)).await.unwrap();
        let mut simulated = signal("zone7", true);
        simulated.source = Origin::Simulated;
        f.manager.on_signal_changed(&simulated).await.unwrap();
        f.manager.raise_building_drill(1, Origin::Test).await.unwrap();
        let _ = topics_seen(&mut f.bus);

        let resolved = f.manager.resolve_simulations().await.unwrap();
        assert_eq!(resolved, 2);
        assert_eq!(active_count(&f.store, "det1@B1").await, 1);
        assert_eq!(active_count(&f.store, "zone7@B1").await, 0);

        let msg = f.bus.try_recv().unwrap();
        assert_eq!(msg.topic, "pci:simulation:resolved");
        assert_eq!(msg.payload["count"], 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_consumer_logs_storage_failure() {
        let f = fixture().await;
        f.store.exec("DROP TABLE alerts").await.unwrap();
        let manager = Arc::new(f.manager);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Arc::clone(&manager).spawn(rx);

        tx.send(signal("det1", true)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(logs_contain("[DATABASE_ERROR] Signal det1@B1=true not persisted"));
    }

    #[tokio::test]
    async fn test_consumer_task_drains_and_stops() {
        let f = fixture().await;
        let manager = Arc::new(f.manager);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Arc::clone(&manager).spawn(rx);

        tx.send(signal("det1", true)).unwrap();
        tx.send(signal("det1", true)).unwrap();
        tx.send(signal("pull1", false)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(active_count(&f.store, "det1@B1").await, 1);
    }
}
