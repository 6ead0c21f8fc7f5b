//! Headless Chromium render engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use errors::{IgnisError, IgnisResult};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::debug;

use super::{CaptureOptions, EngineLauncher, RenderEngine};

const RENDER_POLL: Duration = Duration::from_millis(100);
const RENDER_COMPLETE: &str = "window.renderComplete === true";

fn render_error(context: &str, e: impl std::fmt::Display) -> IgnisError {
    IgnisError::render(format!("{context}: {e}"))
}

pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self, options: &CaptureOptions) -> IgnisResult<Arc<dyn RenderEngine>> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(options.width, options.height)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(|e| render_error("browser config", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| render_error("launch", e))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {}", e);
                }
            }
        });

        Ok(Arc::new(ChromiumEngine {
            browser: Mutex::new(browser),
            events,
        }))
    }
}

pub struct ChromiumEngine {
    browser: Mutex<Browser>,
    events: JoinHandle<()>,
}

impl ChromiumEngine {
    async fn render(page: &Page, url: &str, options: &CaptureOptions) -> IgnisResult<Bytes> {
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(options.width),
            i64::from(options.height),
            options.scale,
            false,
        ))
        .await
        .map_err(|e| render_error("viewport", e))?;

        timeout(options.navigation_timeout, page.goto(url))
            .await
            .map_err(|_| IgnisError::render(format!("navigation timeout: {url}")))?
            .map_err(|e| render_error("navigation", e))?;

        timeout(options.render_timeout, async {
            loop {
                let done = page
                    .evaluate(RENDER_COMPLETE)
                    .await
                    .map_err(|e| render_error("evaluate", e))?
                    .into_value::<bool>()
                    .unwrap_or(false);
                if done {
                    return Ok::<(), IgnisError>(());
                }
                sleep(RENDER_POLL).await;
            }
        })
        .await
        .map_err(|_| IgnisError::render("render complete signal not received"))??;

        let image = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Jpeg)
                    .quality(i64::from(options.jpeg_quality))
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| render_error("screenshot", e))?;
        Ok(Bytes::from(image))
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn capture_page(&self, url: &str, options: &CaptureOptions) -> IgnisResult<Bytes> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| render_error("new page", e))?
        };

        let result = Self::render(&page, url, options).await;
        if let Err(e) = page.close().await {
            debug!("Page close failed: {}", e);
        }
        result
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        self.events.abort();
    }
}
