//! TCP reachability check for configured sites

use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub online: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Open and immediately drop a TCP connection
pub async fn probe_tcp(host: &str, port: u16, limit: Duration) -> ProbeResult {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => ProbeResult {
            online: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => ProbeResult {
            online: false,
            latency_ms: None,
            error: Some(e.to_string()),
        },
        Err(_) => ProbeResult {
            online: false,
            latency_ms: None,
            error: Some(format!("Timeout after {}ms", limit.as_millis())),
        },
    }
}

/// Site to probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeTarget {
    pub site_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteProbe {
    pub site_id: String,
    pub address: String,
    #[serde(flatten)]
    pub result: ProbeResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub percentage: f64,
    pub details: Vec<SiteProbe>,
}

/// Probe every site concurrently
pub async fn check_all_sites(targets: &[ProbeTarget], limit: Duration) -> ConnectivityReport {
    let details: Vec<SiteProbe> = join_all(targets.iter().map(|t| async move {
        let result = probe_tcp(&t.host, t.port, limit).await;
        debug!("Probe {} {}:{} online={}", t.site_id, t.host, t.port, result.online);
        SiteProbe {
            site_id: t.site_id.clone(),
            address: format!("{}:{}", t.host, t.port),
            result,
        }
    }))
    .await;

    let total = details.len();
    let online = details.iter().filter(|d| d.result.online).count();
    let percentage = if total == 0 {
        0.0
    } else {
        (online as f64 / total as f64 * 1000.0).round() / 10.0
    };

    ConnectivityReport {
        total,
        online,
        offline: total - online,
        percentage,
        details,
    }
}
