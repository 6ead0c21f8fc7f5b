//! Building-automation adapter: ReadProperty polling over the shared client

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::client::BacnetClient;
use super::codec::{ObjectId, ObjectType};
use crate::adapter::{PointAdapter, PointReading, PollFailure};
use crate::error::{LinkError, Result};

/// Binary point read from a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacnetPoint {
    pub name: String,
    #[serde(default = "default_object_type")]
    pub object_type: ObjectType,
    pub instance: u32,
}

fn default_object_type() -> ObjectType {
    ObjectType::BinaryInput
}

/// Site descriptor for the building-automation adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacnetTarget {
    pub host: String,
    pub port: u16,
    /// When set and discovered, the I-Am source address wins over host:port
    pub device_instance: Option<u32>,
    pub points: Vec<BacnetPoint>,
}

#[derive(Debug)]
pub struct BacnetSession {
    address: SocketAddr,
    points: Vec<BacnetPoint>,
}

/// BACnet/IP implementation of [`PointAdapter`]
#[derive(Clone)]
pub struct BacnetAdapter {
    client: Arc<BacnetClient>,
}

impl BacnetAdapter {
    pub fn new(client: Arc<BacnetClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<BacnetClient> {
        &self.client
    }

    async fn resolve(&self, target: &BacnetTarget) -> Result<SocketAddr> {
        if let Some(device) = target.device_instance.and_then(|id| self.client.device(id)) {
            return Ok(device.address);
        }
        let endpoint = format!("{}:{}", target.host, target.port);
        let mut addrs = tokio::net::lookup_host(endpoint.as_str())
            .await
            .map_err(|e| LinkError::connection(format!("Resolve {endpoint}: {e}")))?;
        let found = addrs.find(SocketAddr::is_ipv4);
        found.ok_or_else(|| LinkError::connection(format!("No IPv4 address for {endpoint}")))
    }
}

#[async_trait]
impl PointAdapter for BacnetAdapter {
    type Target = BacnetTarget;
    type Session = BacnetSession;

    fn protocol(&self) -> &'static str {
        "bacnet"
    }

    fn endpoint(&self, target: &BacnetTarget) -> String {
        format!("{}:{}", target.host, target.port)
    }

    async fn connect(&self, target: &BacnetTarget) -> Result<BacnetSession> {
        if target.points.is_empty() {
            return Err(LinkError::config(format!(
                "{}: no points configured",
                self.endpoint(target)
            )));
        }
        let address = self.resolve(target).await?;
        Ok(BacnetSession {
            address,
            points: target.points.clone(),
        })
    }

    /// Each point is read on its own; the cycle fails only if none answered
    async fn poll(
        &self,
        session: &mut BacnetSession,
    ) -> std::result::Result<Vec<PointReading>, PollFailure> {
        let mut readings = Vec::with_capacity(session.points.len());
        let mut last_error = None;

        for point in &session.points {
            let object = ObjectId::new(point.object_type, point.instance);
            match self.client.read_present_value(session.address, object).await {
                Ok(value) => readings.push(PointReading::new(&point.name, point.instance, value)),
                Err(e) => {
                    warn!("BACnet {} {}: {}", session.address, point.name, e);
                    last_error = Some(e);
                },
            }
        }

        match last_error {
            Some(error) if readings.is_empty() => Err(PollFailure::new(readings, error)),
            _ => Ok(readings),
        }
    }

    async fn disconnect(&self, _session: BacnetSession) {}
}
