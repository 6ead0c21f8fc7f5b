//! Fieldbus adapter: one Modbus TCP session per site

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::connection::ModbusTcpClient;
use super::pdu::RegionKind;
use crate::adapter::{PointAdapter, PointReading, PollFailure};
use crate::error::{LinkError, Result};

/// One contiguous block of points mapped to logical names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMapping {
    #[serde(rename = "type", alias = "region")]
    pub region: RegionKind,
    pub address: u16,
    pub count: u16,
    pub names: Vec<String>,
}

impl ReadMapping {
    /// Two discrete inputs named `di0`, `di1`
    pub fn default_mapping() -> Self {
        Self {
            region: RegionKind::DiscreteInputs,
            address: 0,
            count: 2,
            names: vec!["di0".to_string(), "di1".to_string()],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.count > self.region.max_count() {
            return Err(LinkError::config(format!(
                "{} at {}: count {} out of range 1..={}",
                self.region,
                self.address,
                self.count,
                self.region.max_count()
            )));
        }
        if self.names.len() != self.count as usize {
            return Err(LinkError::config(format!(
                "{} at {}: {} names for {} points",
                self.region,
                self.address,
                self.names.len(),
                self.count
            )));
        }
        if u32::from(self.address) + u32::from(self.count) > 0x1_0000 {
            return Err(LinkError::config(format!(
                "{} at {}: block exceeds address space",
                self.region, self.address
            )));
        }
        Ok(())
    }
}

/// Site descriptor for the fieldbus adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusTarget {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
    pub mappings: Vec<ReadMapping>,
}

/// Live fieldbus session
#[derive(Debug)]
pub struct ModbusSession {
    client: ModbusTcpClient,
    mappings: Vec<ReadMapping>,
}

/// Modbus TCP implementation of [`PointAdapter`]
#[derive(Debug, Clone, Default)]
pub struct ModbusAdapter;

impl ModbusAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PointAdapter for ModbusAdapter {
    type Target = ModbusTarget;
    type Session = ModbusSession;

    fn protocol(&self) -> &'static str {
        "modbus"
    }

    fn endpoint(&self, target: &ModbusTarget) -> String {
        format!("{}:{}", target.host, target.port)
    }

    async fn connect(&self, target: &ModbusTarget) -> Result<ModbusSession> {
        let client =
            ModbusTcpClient::connect(&target.host, target.port, target.unit_id, target.timeout)
                .await?;
        let mappings = if target.mappings.is_empty() {
            vec![ReadMapping::default_mapping()]
        } else {
            target.mappings.clone()
        };
        Ok(ModbusSession { client, mappings })
    }

    /// Regions are read in order; a failing region ends the cycle
    async fn poll(
        &self,
        session: &mut ModbusSession,
    ) -> std::result::Result<Vec<PointReading>, PollFailure> {
        let mut readings = Vec::new();
        for mapping in &session.mappings {
            match session
                .client
                .read(mapping.region, mapping.address, mapping.count)
                .await
            {
                Ok(values) => {
                    if values.len() != mapping.names.len() {
                        debug!(
                            "{} {}: {} values for {} names, skipped",
                            session.client.peer(),
                            mapping.region,
                            values.len(),
                            mapping.names.len()
                        );
                        continue;
                    }
                    readings.extend(mapping.names.iter().zip(values).enumerate().map(
                        |(idx, (name, value))| {
                            PointReading::new(
                                name.clone(),
                                u32::from(mapping.address) + idx as u32,
                                value,
                            )
                        },
                    ));
                },
                Err(error) => return Err(PollFailure::new(readings, error)),
            }
        }
        Ok(readings)
    }

    async fn disconnect(&self, session: ModbusSession) {
        session.client.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target(port: u16, mappings: Vec<ReadMapping>) -> ModbusTarget {
        ModbusTarget {
            host: "127.0.0.1".to_string(),
            port,
            unit_id: 1,
            timeout: Duration::from_millis(500),
            mappings,
        }
    }

    #[test]
    fn test_mapping_validation() {
        assert!(ReadMapping::default_mapping().validate().is_ok());

        let mut mapping = ReadMapping::default_mapping();
        mapping.names.pop();
        assert!(mapping.validate().is_err());

        let mapping = ReadMapping {
            region: RegionKind::HoldingRegisters,
            address: 0,
            count: 200,
            names: (0..200).map(|i| format!("r{i}")).collect(),
        };
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_mapping_deserializes_type_field() {
        let mapping: ReadMapping = serde_json::from_str(
            r#"{"type":"Coils","address":4,"count":1,"names":["bell"]}"#,
        )
        .unwrap();
        assert_eq!(mapping.region, RegionKind::Coils);
        assert_eq!(mapping.address, 4);
    }

    #[tokio::test]
    async fn test_poll_keeps_partial_readings_on_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // First region answers, second gets an exception
            let mut req = [0u8; 12];
            socket.read_exact(&mut req).await.unwrap();
            let resp = [req[0], req[1], 0, 0, 0, 4, req[6], 0x02, 0x01, 0b10];
            socket.write_all(&resp).await.unwrap();

            socket.read_exact(&mut req).await.unwrap();
            let resp = [req[0], req[1], 0, 0, 0, 3, req[6], 0x81, 0x02];
            socket.write_all(&resp).await.unwrap();
        });

        let adapter = ModbusAdapter::new();
        let mappings = vec![
            ReadMapping {
                region: RegionKind::DiscreteInputs,
                address: 10,
                count: 2,
                names: vec!["det1".into(), "det2".into()],
            },
            ReadMapping {
                region: RegionKind::Coils,
                address: 0,
                count: 1,
                names: vec!["bell".into()],
            },
        ];
        let mut session = adapter.connect(&target(port, mappings)).await.unwrap();
        let failure = adapter.poll(&mut session).await.unwrap_err();

        assert_eq!(
            failure.partial,
            vec![
                PointReading::new("det1", 10, false),
                PointReading::new("det2", 11, true),
            ]
        );
        assert!(matches!(failure.error, LinkError::ModbusException { .. }));

        adapter.disconnect(session).await;
        server.await.unwrap();
    }
}
