//! Pipeline composition
//!
//! pollers -> `SignalChanged` -> lifecycle -> `AlarmEvent` -> dispatcher
//!
//! Both hops are unbounded single-consumer channels. Shutdown closes them
//! front to back so queued events are drained, not dropped.

use std::sync::Arc;
use std::time::Duration;

use common::DataStore;
use errors::IgnisResult;
use ignis_protocols::modbus::ModbusAdapter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bus::{EventSink, LogSink, RedisSink, SinkKind};
use crate::config::{AppConfig, EventsConfig, EvidenceConfig};
use crate::domain::SignalChanged;
use crate::evidence::{EngineLauncher, EvidenceRenderer, EvidenceSource, NoEvidence};
use crate::lifecycle::AlarmLifecycleManager;
use crate::notify::{NotificationDispatcher, Transports};
use crate::poller::connectivity::ProbeTarget;
use crate::poller::modbus::load_store_sites;
use crate::poller::{BacnetPoller, ModbusPoller, SiteStatus};

/// Upper bound for draining queued notifications on shutdown
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound event sink selected by configuration
pub async fn build_sink(config: &EventsConfig) -> IgnisResult<Arc<dyn EventSink>> {
    match config.sink {
        SinkKind::Log => Ok(Arc::new(LogSink)),
        SinkKind::Redis => {
            let sink = RedisSink::connect(&config.redis_url, config.channel_prefix.clone()).await?;
            Ok(Arc::new(sink))
        },
    }
}

#[cfg(feature = "chromium")]
fn engine_launcher(config: &EvidenceConfig) -> Option<Arc<dyn EngineLauncher>> {
    Some(Arc::new(crate::evidence::chromium::ChromiumLauncher::new(
        config.chrome_executable.clone(),
    )))
}

#[cfg(not(feature = "chromium"))]
fn engine_launcher(_: &EvidenceConfig) -> Option<Arc<dyn EngineLauncher>> {
    warn!("Evidence enabled but built without chromium support");
    None
}

/// Evidence source for the dispatcher, plus the renderer to shut down
pub fn build_evidence(
    config: &EvidenceConfig,
) -> (Arc<dyn EvidenceSource>, Option<Arc<EvidenceRenderer>>) {
    if !config.enabled {
        return (Arc::new(NoEvidence), None);
    }
    match engine_launcher(config) {
        Some(launcher) => {
            let renderer = Arc::new(EvidenceRenderer::new(
                launcher,
                config.base_url.clone(),
                config.capture_options(),
            ));
            info!("Evidence renderer: {}", config.base_url);
            (Arc::clone(&renderer) as Arc<dyn EvidenceSource>, Some(renderer))
        },
        None => (Arc::new(NoEvidence), None),
    }
}

/// TCP endpoints of every fieldbus site, configured or stored
pub async fn probe_targets(
    config: &AppConfig,
    store: &dyn DataStore,
) -> IgnisResult<Vec<ProbeTarget>> {
    let mut targets: Vec<ProbeTarget> = config
        .modbus
        .sites
        .iter()
        .map(|site| ProbeTarget {
            site_id: site.site_id(),
            host: site.host.clone(),
            port: site.port,
        })
        .collect();

    if config.modbus.load_sites_from_store {
        for spec in load_store_sites(store, &config.modbus).await? {
            if targets.iter().all(|t| t.site_id != spec.site_id) {
                targets.push(ProbeTarget {
                    site_id: spec.site_id,
                    host: spec.target.host,
                    port: spec.target.port,
                });
            }
        }
    }
    Ok(targets)
}

pub struct AlarmPipeline {
    signals: mpsc::UnboundedSender<SignalChanged>,
    lifecycle: Arc<AlarmLifecycleManager>,
    dispatcher: Arc<NotificationDispatcher>,
    lifecycle_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
    modbus: ModbusPoller,
    bacnet: Option<BacnetPoller>,
    renderer: Option<Arc<EvidenceRenderer>>,
}

impl AlarmPipeline {
    /// Build channels and evidence from configuration, then start
    ///
    /// Only an unusable notification setup is an error; pollers that fail to
    /// start are logged and left out.
    pub async fn start(
        config: &AppConfig,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn EventSink>,
    ) -> IgnisResult<Self> {
        let transports = Transports::from_config(&config.notifications)?;
        let (evidence, renderer) = build_evidence(&config.evidence);
        Ok(Self::start_with(config, store, sink, transports, evidence, renderer).await)
    }

    /// Spawn the consumers, then start polling
    pub async fn start_with(
        config: &AppConfig,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn EventSink>,
        transports: Transports,
        evidence: Arc<dyn EvidenceSource>,
        renderer: Option<Arc<EvidenceRenderer>>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (alarm_tx, alarm_rx) = mpsc::unbounded_channel();

        // ============ Consumers ============
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store),
            transports,
            evidence,
            config.notifications.settings(),
        ));
        let dispatcher_task = Arc::clone(&dispatcher).spawn(alarm_rx);

        let lifecycle = Arc::new(
            AlarmLifecycleManager::new(Arc::clone(&store), sink, alarm_tx)
                .with_site_ids(config.site_ids()),
        );
        let lifecycle_task = Arc::clone(&lifecycle).spawn(signal_rx);

        // ============ Pollers ============
        let mut modbus = ModbusPoller::new(Arc::new(ModbusAdapter::new()), signal_tx.clone());
        modbus.start(&config.modbus).await;
        if config.modbus.load_sites_from_store {
            if let Err(e) = modbus
                .start_from_store(store.as_ref(), &config.modbus)
                .await
            {
                warn!("Modbus sites from store not loaded: {}", e);
            }
        }

        let bacnet = if config.bacnet.enabled {
            match BacnetPoller::start(&config.bacnet, signal_tx.clone()).await {
                Ok(poller) => Some(poller),
                Err(e) => {
                    warn!("BACnet poller not started: {}", e);
                    None
                },
            }
        } else {
            None
        };

        info!(
            "Pipeline started: {} modbus sites, {} bacnet sites",
            modbus.len(),
            bacnet.as_ref().map_or(0, |b| b.status().len())
        );

        Self {
            signals: signal_tx,
            lifecycle,
            dispatcher,
            lifecycle_task,
            dispatcher_task,
            modbus,
            bacnet,
            renderer,
        }
    }

    /// Feed signal edges from outside the pollers
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<SignalChanged> {
        self.signals.clone()
    }

    pub fn lifecycle(&self) -> &Arc<AlarmLifecycleManager> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn modbus_mut(&mut self) -> &mut ModbusPoller {
        &mut self.modbus
    }

    pub fn status(&self) -> Vec<SiteStatus> {
        let mut status = self.modbus.status();
        if let Some(bacnet) = &self.bacnet {
            status.extend(bacnet.status());
        }
        status
    }

    pub async fn shutdown(self) {
        let Self {
            signals,
            lifecycle,
            dispatcher,
            lifecycle_task,
            dispatcher_task,
            mut modbus,
            bacnet,
            renderer,
        } = self;

        info!("Stopping pollers");
        modbus.stop().await;
        drop(modbus);
        if let Some(mut bacnet) = bacnet {
            bacnet.stop().await;
        }

        // Closing the signal channel lets the lifecycle task drain and exit
        drop(signals);
        if let Err(e) = lifecycle_task.await {
            warn!("Lifecycle task ended abnormally: {}", e);
        }

        // Last holder of the alarm sender
        drop(lifecycle);
        match timeout(DISPATCH_DRAIN_TIMEOUT, dispatcher_task).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("Dispatcher task ended abnormally: {}", e),
            Err(_) => warn!("Dispatcher still busy after {:?}", DISPATCH_DRAIN_TIMEOUT),
        }
        drop(dispatcher);

        if let Some(renderer) = renderer {
            renderer.shutdown().await;
        }
        info!("Pipeline stopped");
    }
}
