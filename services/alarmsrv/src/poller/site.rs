//! One site's connect / poll / reconnect loop

use std::sync::Arc;

use chrono::Utc;
use ignis_protocols::{ConnectionState, LinkError, PointAdapter, PointReading};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signal::SignalState;
use super::{SiteSpec, SiteStatus};
use crate::domain::SignalChanged;

enum SessionEnd {
    Cancelled,
    Failed(LinkError),
}

/// Everything a site task owns
pub(crate) struct SiteTask<A: PointAdapter> {
    pub(crate) adapter: Arc<A>,
    pub(crate) spec: SiteSpec<A::Target>,
    pub(crate) events: mpsc::UnboundedSender<SignalChanged>,
    pub(crate) status: Arc<RwLock<SiteStatus>>,
    pub(crate) cancel: CancellationToken,
}

impl<A: PointAdapter> SiteTask<A> {
    pub(crate) async fn run(self) {
        let site = self.spec.site_id.clone();
        let endpoint = self.adapter.endpoint(&self.spec.target);

        loop {
            self.begin_attempt();
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.adapter.connect(&self.spec.target) => result,
            };

            match connected {
                Ok(session) => {
                    info!(
                        "Site {} connected: {} {}",
                        site,
                        self.adapter.protocol(),
                        endpoint
                    );
                    match self.poll_session(session).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => {
                            warn!("Site {} read error: {}", site, e);
                            self.mark_disconnected(Some(e.to_string()));
                        },
                    }
                },
                Err(e) => {
                    warn!("Site {} connect failed ({}): {}", site, endpoint, e);
                    self.mark_disconnected(Some(e.to_string()));
                },
            }

            info!("Site {} reconnect in {:?}", site, self.spec.reconnect_delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.spec.reconnect_delay) => {},
            }
        }

        self.mark_disconnected(None);
        debug!("Site {} task stopped", site);
    }

    /// Poll until cancelled or a cycle fails; signal state starts unknown
    async fn poll_session(&self, mut session: A::Session) -> SessionEnd {
        let mut signals = SignalState::new();
        self.mark_connected();

        let period = self.spec.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.adapter.disconnect(session).await;
                    return SessionEnd::Cancelled;
                },
                _ = ticker.tick() => {},
            }

            match self.adapter.poll(&mut session).await {
                Ok(readings) => self.apply(&mut signals, readings),
                Err(failure) => {
                    // Points read before the failure are still valid
                    self.apply(&mut signals, failure.partial);
                    self.adapter.disconnect(session).await;
                    return SessionEnd::Failed(failure.error);
                },
            }
        }
    }

    fn apply(&self, signals: &mut SignalState, readings: Vec<PointReading>) {
        if readings.is_empty() {
            return;
        }

        for reading in readings {
            let Some(value) = signals.observe(&reading.name, reading.value) else {
                continue;
            };
            debug!(
                "Site {} {} -> {}",
                self.spec.site_id, reading.name, value
            );
            let event = SignalChanged {
                site_id: self.spec.site_id.clone(),
                building_id: self.spec.building_id,
                description: format!("Alarm {}", reading.name),
                kind: self.spec.kind_of(&reading.name),
                point_id: reading.name,
                address: reading.address,
                value,
                source: self.spec.origin,
                timestamp: Utc::now(),
            };
            if self.events.send(event).is_err() {
                debug!("Site {}: signal consumer closed", self.spec.site_id);
            }
        }

        let mut status = self.status.write();
        status.last_values = signals.snapshot();
        status.updated_at = Utc::now();
    }

    fn begin_attempt(&self) {
        let mut status = self.status.write();
        status.state = ConnectionState::Connecting;
        status.connect_attempts += 1;
        status.updated_at = Utc::now();
    }

    fn mark_connected(&self) {
        let mut status = self.status.write();
        status.state = ConnectionState::Connected;
        status.last_values.clear();
        status.last_error = None;
        status.updated_at = Utc::now();
    }

    fn mark_disconnected(&self, error: Option<String>) {
        let mut status = self.status.write();
        status.state = ConnectionState::Disconnected;
        if error.is_some() {
            status.last_error = error;
        }
        status.updated_at = Utc::now();
    }
}
