//! Floor-plan evidence capture
//!
//! One headless engine is launched lazily and shared by every capture. Each
//! capture opens its own page. When a capture fails the engine that served it
//! is torn down, and the next capture launches a fresh one. Callers never see
//! an error from a failed render, only an absent image.

#[cfg(feature = "chromium")]
pub mod chromium;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use errors::{IgnisError, IgnisResult};
use reqwest::Url;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::FloorAssignment;

/// Extra time allowed for the screenshot itself
const SCREENSHOT_ALLOWANCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub navigation_timeout: Duration,
    pub render_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            scale: 2.0,
            navigation_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_secs(5),
            jpeg_quality: 80,
        }
    }
}

impl CaptureOptions {
    fn overall_timeout(&self) -> Duration {
        self.navigation_timeout + self.render_timeout + SCREENSHOT_ALLOWANCE
    }
}

/// Snapshot of the floor plan with a device highlighted
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn capture(
        &self,
        floor: FloorAssignment,
        device_id: &str,
        building_id: i64,
    ) -> IgnisResult<Option<Bytes>>;
}

/// Renderer used when capture is disabled
pub struct NoEvidence;

#[async_trait]
impl EvidenceSource for NoEvidence {
    async fn capture(&self, _: FloorAssignment, _: &str, _: i64) -> IgnisResult<Option<Bytes>> {
        Ok(None)
    }
}

/// A running headless engine
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Render `url` in a fresh page and return a JPEG; the page is always closed
    async fn capture_page(&self, url: &str, options: &CaptureOptions) -> IgnisResult<Bytes>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, options: &CaptureOptions) -> IgnisResult<Arc<dyn RenderEngine>>;
}

pub struct EvidenceRenderer {
    launcher: Arc<dyn EngineLauncher>,
    base_url: String,
    options: CaptureOptions,
    engine: Mutex<Option<Arc<dyn RenderEngine>>>,
}

impl EvidenceRenderer {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        base_url: impl Into<String>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            launcher,
            base_url: base_url.into(),
            options,
            engine: Mutex::new(None),
        }
    }

    /// `{base}/map_renderer.html?buildingId=..&floorId=..&deviceId=..`
    pub fn page_url(&self, building_id: i64, floor_id: i64, device_id: &str) -> IgnisResult<Url> {
        let page = format!("{}/map_renderer.html", self.base_url.trim_end_matches('/'));
        Url::parse_with_params(
            &page,
            &[
                ("buildingId", building_id.to_string()),
                ("floorId", floor_id.to_string()),
                ("deviceId", device_id.to_string()),
            ],
        )
        .map_err(|e| IgnisError::render(format!("{page}: {e}")))
    }

    async fn engine(&self) -> IgnisResult<Arc<dyn RenderEngine>> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = self.launcher.launch(&self.options).await?;
        info!("Render engine started");
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Discard `failed` unless another capture already replaced it
    async fn reset(&self, failed: &Arc<dyn RenderEngine>) {
        let stale = {
            let mut slot = self.engine.lock().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => slot.take(),
                _ => None,
            }
        };
        if let Some(engine) = stale {
            warn!("Render engine reset");
            engine.close().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    pub async fn shutdown(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.close().await;
            info!("Render engine closed");
        }
    }
}

#[async_trait]
impl EvidenceSource for EvidenceRenderer {
    async fn capture(
        &self,
        floor: FloorAssignment,
        device_id: &str,
        building_id: i64,
    ) -> IgnisResult<Option<Bytes>> {
        let Some(floor_id) = floor.floor_id() else {
            debug!("No evidence for {}: unmapped floor", device_id);
            return Ok(None);
        };
        let url = match self.page_url(building_id, floor_id, device_id) {
            Ok(url) => url,
            Err(e) => {
                warn!("Evidence URL: {}", e);
                return Ok(None);
            },
        };

        let engine = match self.engine().await {
            Ok(engine) => engine,
            Err(e) => {
                warn!("Render engine launch failed: {}", e);
                return Ok(None);
            },
        };

        match timeout(
            self.options.overall_timeout(),
            engine.capture_page(url.as_str(), &self.options),
        )
        .await
        {
            Ok(Ok(image)) if !image.is_empty() => {
                debug!("Evidence for {}: {} bytes", device_id, image.len());
                Ok(Some(image))
            },
            Ok(Ok(_)) => {
                warn!("Evidence for {} is empty", device_id);
                Ok(None)
            },
            Ok(Err(e)) => {
                warn!("Evidence for {} failed: {}", device_id, e);
                self.reset(&engine).await;
                Ok(None)
            },
            Err(_) => {
                warn!(
                    "Evidence for {} timed out after {:?}",
                    device_id,
                    self.options.overall_timeout()
                );
                self.reset(&engine).await;
                Ok(None)
            },
        }
    }
}
