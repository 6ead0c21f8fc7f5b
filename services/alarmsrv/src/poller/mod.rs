//! Protocol pollers
//!
//! A [`SitePoller`] owns one task per monitored site, keyed by site id.
//! Each task owns its session, its signal state and its timers; the only
//! thing it shares is a read-only status snapshot. Value transitions leave
//! the poller as [`SignalChanged`] events on an unbounded channel.

pub mod bacnet;
pub mod connectivity;
pub mod modbus;
pub mod signal;
mod site;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use ignis_protocols::{ConnectionState, PointAdapter};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{Origin, PointKind, SignalChanged};
use site::SiteTask;

pub use bacnet::BacnetPoller;
pub use modbus::ModbusPoller;
pub use signal::SignalState;

/// How long a stopping site may take to close its session
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Everything needed to run one site
#[derive(Debug, Clone)]
pub struct SiteSpec<T> {
    pub site_id: String,
    pub building_id: i64,
    pub origin: Origin,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    /// Point kinds by logical name; points with no device row are binary alarms
    pub kinds: HashMap<String, PointKind>,
    pub target: T,
}

impl<T> SiteSpec<T> {
    pub fn kind_of(&self, point: &str) -> PointKind {
        self.kinds.get(point).copied().unwrap_or_default()
    }
}

/// Snapshot of one site published by its task
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub site_id: String,
    pub building_id: i64,
    pub protocol: &'static str,
    pub address: String,
    pub state: ConnectionState,
    pub connect_attempts: u64,
    pub last_values: BTreeMap<String, bool>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct SiteHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: Arc<RwLock<SiteStatus>>,
}

impl SiteHandle {
    async fn stop(self, site_id: &str) {
        self.cancel.cancel();
        let mut task = self.task;
        if timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("Site {} did not stop in {:?}, aborting", site_id, STOP_GRACE);
            task.abort();
        }
    }
}

/// Site arena for one protocol adapter
pub struct SitePoller<A: PointAdapter> {
    adapter: Arc<A>,
    events: mpsc::UnboundedSender<SignalChanged>,
    sites: HashMap<String, SiteHandle>,
}

impl<A: PointAdapter> SitePoller<A> {
    pub fn new(adapter: Arc<A>, events: mpsc::UnboundedSender<SignalChanged>) -> Self {
        Self {
            adapter,
            events,
            sites: HashMap::new(),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Start polling a site, replacing any running task for the same id
    pub async fn connect_site(&mut self, spec: SiteSpec<A::Target>) {
        let site_id = spec.site_id.clone();
        if let Some(previous) = self.sites.remove(&site_id) {
            previous.stop(&site_id).await;
        }

        let status = Arc::new(RwLock::new(SiteStatus {
            site_id: site_id.clone(),
            building_id: spec.building_id,
            protocol: self.adapter.protocol(),
            address: self.adapter.endpoint(&spec.target),
            state: ConnectionState::Disconnected,
            connect_attempts: 0,
            last_values: BTreeMap::new(),
            last_error: None,
            updated_at: Utc::now(),
        }));
        let cancel = CancellationToken::new();

        let task = SiteTask {
            adapter: Arc::clone(&self.adapter),
            spec,
            events: self.events.clone(),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(task.run());

        info!("Site {} added ({})", site_id, self.adapter.protocol());
        self.sites.insert(
            site_id,
            SiteHandle {
                cancel,
                task,
                status,
            },
        );
    }

    /// Stop one site; false if it was not running
    pub async fn disconnect_site(&mut self, site_id: &str) -> bool {
        let Some(handle) = self.sites.remove(site_id) else {
            return false;
        };
        handle.stop(site_id).await;
        info!("Site {} removed", site_id);
        true
    }

    /// Stop every site
    pub async fn stop(&mut self) {
        let handles: Vec<_> = self.sites.drain().collect();
        let count = handles.len();
        join_all(
            handles
                .into_iter()
                .map(|(site_id, handle)| async move { handle.stop(&site_id).await }),
        )
        .await;
        if count > 0 {
            info!("{} poller stopped ({} sites)", self.adapter.protocol(), count);
        }
    }

    pub fn status(&self) -> Vec<SiteStatus> {
        let mut sites: Vec<_> = self.sites.values().map(|h| h.status.read().clone()).collect();
        sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        sites
    }

    pub fn site_status(&self, site_id: &str) -> Option<SiteStatus> {
        self.sites.get(site_id).map(|h| h.status.read().clone())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl<A: PointAdapter> Drop for SitePoller<A> {
    fn drop(&mut self) {
        for handle in self.sites.values() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }
}
