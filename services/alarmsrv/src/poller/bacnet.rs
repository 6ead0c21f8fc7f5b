//! Building-automation poller
//!
//! All sites share one UDP client; discovery runs beside the site tasks.

use std::sync::Arc;

use errors::{IgnisError, IgnisResult};
use ignis_protocols::bacnet::{BacnetAdapter, BacnetClient, DiscoveredDevice};
use tokio::sync::mpsc;
use tracing::info;

use super::{SitePoller, SiteStatus};
use crate::config::{BacnetConfig, BacnetSiteConfig};
use crate::domain::SignalChanged;

pub struct BacnetPoller {
    client: Arc<BacnetClient>,
    sites: SitePoller<BacnetAdapter>,
    config: BacnetConfig,
}

impl BacnetPoller {
    /// Bind the client, start discovery and connect every configured site
    pub async fn start(
        config: &BacnetConfig,
        events: mpsc::UnboundedSender<SignalChanged>,
    ) -> IgnisResult<Self> {
        let client = BacnetClient::bind(
            config.local_port,
            config.broadcast_addr()?,
            config.apdu_timeout(),
        )
        .await
        .map_err(|e| IgnisError::protocol("bacnet", e.to_string()))?;
        client.start_discovery(config.discovery_interval());

        let adapter = Arc::new(BacnetAdapter::new(Arc::clone(&client)));
        let mut poller = Self {
            client,
            sites: SitePoller::new(adapter, events),
            config: config.clone(),
        };
        for site in &config.sites {
            poller.connect_site(site).await;
        }
        info!("BACnet poller started ({} sites)", poller.sites.len());
        Ok(poller)
    }

    pub async fn connect_site(&mut self, site: &BacnetSiteConfig) {
        self.sites.connect_site(site.to_spec(&self.config)).await;
    }

    pub async fn disconnect_site(&mut self, site_id: &str) -> bool {
        self.sites.disconnect_site(site_id).await
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.client.discovered_devices()
    }

    pub fn status(&self) -> Vec<SiteStatus> {
        self.sites.status()
    }

    pub async fn stop(&mut self) {
        self.sites.stop().await;
        self.client.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::BacnetPointConfig;
    use crate::domain::{Origin, PointKind};
    use ignis_protocols::bacnet::codec::{
        decode_frame, encode_read_property_ack, Apdu, PROPERTY_PRESENT_VALUE,
    };
    use ignis_protocols::bacnet::{BacnetPoint, ObjectId, ObjectType, PropertyValue};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    /// Answers present-value reads from a script, repeating the last value
    async fn scripted_device(values: Vec<bool>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let mut served = 0usize;
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(Apdu::ConfirmedRequest {
                    invoke_id, payload, ..
                }) = decode_frame(&buf[..len])
                else {
                    continue;
                };
                let object = ObjectId::decode(u32::from_be_bytes([
                    payload[1], payload[2], payload[3], payload[4],
                ]));
                let value = values[served.min(values.len() - 1)];
                served += 1;
                let reply = encode_read_property_ack(
                    invoke_id,
                    object,
                    PROPERTY_PRESENT_VALUE,
                    &PropertyValue::Enumerated(u32::from(value)),
                );
                let _ = socket.send_to(&reply, src).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_rising_edge_from_device() {
        let port = scripted_device(vec![false, false, true]).await;
        let config = BacnetConfig {
            enabled: true,
            local_port: 0,
            broadcast_address: format!("127.0.0.1:{port}"),
            poll_interval_ms: 50,
            apdu_timeout_ms: 500,
            sites: vec![BacnetSiteConfig {
                site_id: None,
                building_id: 3,
                host: "127.0.0.1".to_string(),
                port,
                device_instance: None,
                origin: Some(Origin::Test),
                points: vec![BacnetPointConfig {
                    point: BacnetPoint {
                        name: "pull1".to_string(),
                        object_type: ObjectType::BinaryInput,
                        instance: 1,
                    },
                    kind: PointKind::PullStation,
                }],
            }],
            ..BacnetConfig::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = BacnetPoller::start(&config, tx).await.unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.site_id, "B3");
        assert_eq!(event.point_id, "pull1");
        assert!(event.value);
        assert_eq!(event.source, Origin::Test);
        assert_eq!(event.kind, PointKind::PullStation);
        assert_eq!(event.address, 1);

        let status = poller.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].protocol, "bacnet");

        poller.stop().await;
    }
}
