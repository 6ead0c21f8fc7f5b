//! Modbus TCP connection management
//!
//! One TCP session per site, MBAP framed, strictly request/response.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use super::pdu::{ModbusPdu, RegionKind};
use crate::error::{LinkError, Result};

/// Modbus TCP client bound to one unit on one peer
#[derive(Debug)]
pub struct ModbusTcpClient {
    stream: TcpStream,
    peer: String,
    unit_id: u8,
    transaction_id: u16,
    timeout: Duration,
}

impl ModbusTcpClient {
    /// Open a TCP session; connect is bounded by `timeout_duration`
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout_duration: Duration,
    ) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);

        match timeout(timeout_duration, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }

                info!("TCP connected: {}", addr);
                Ok(Self {
                    stream,
                    peer: addr,
                    unit_id,
                    transaction_id: 0,
                    timeout: timeout_duration,
                })
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                Err(LinkError::connection(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(LinkError::timeout(format!("Connection to {addr} timed out")))
            },
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read `count` points of `region` starting at `address`
    pub async fn read(
        &mut self,
        region: RegionKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        let request = ModbusPdu::read_request(region, address, count)?;
        let response = self.request(&request).await?;
        response.parse_read_response(region, count)
    }

    /// Send one PDU and wait for its response PDU
    pub async fn request(&mut self, pdu: &ModbusPdu) -> Result<ModbusPdu> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;

        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu.as_slice());

        self.send(&frame).await?;
        let (header, body) = self.receive().await?;

        let resp_tid = u16::from_be_bytes([header[0], header[1]]);
        if resp_tid != tid {
            return Err(LinkError::protocol(format!(
                "Transaction id mismatch: sent {}, got {}",
                tid, resp_tid
            )));
        }
        if header[6] != self.unit_id {
            return Err(LinkError::protocol(format!(
                "Unit id mismatch: expected {}, got {}",
                self.unit_id, header[6]
            )));
        }

        ModbusPdu::from_slice(&body)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match timeout(self.timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => {
                debug!("TCP TX: {}B", data.len());
                Ok(())
            },
            Ok(Err(e)) => {
                error!("TCP TX: {}", e);
                Err(LinkError::io(format!("TCP send error: {e}")))
            },
            Err(_) => Err(LinkError::timeout("TCP send timeout")),
        }
    }

    /// Read one complete frame: MBAP header, then `length - 1` PDU bytes
    async fn receive(&mut self) -> Result<([u8; MBAP_HEADER_LEN], Vec<u8>)> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(self.timeout, self.stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                error!("TCP header RX: {}", e);
                return Err(LinkError::io(format!("TCP header read error: {e}")));
            },
            Err(_) => {
                debug!("TCP header timeout");
                return Err(LinkError::timeout("TCP header read timeout"));
            },
        }

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || length > MAX_MBAP_LENGTH {
            error!("TCP invalid len: {}", length);
            return Err(LinkError::protocol(format!(
                "Invalid TCP frame length: {}",
                length
            )));
        }

        // Length counts the unit id already held in the header
        let mut body = vec![0u8; length - 1];
        match timeout(self.timeout, self.stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {
                debug!("TCP RX: {}B", MBAP_HEADER_LEN + body.len());
                Ok((header, body))
            },
            Ok(Err(e)) => {
                error!("TCP PDU RX: {}", e);
                Err(LinkError::io(format!("TCP PDU read error: {e}")))
            },
            Err(_) => {
                debug!("TCP PDU timeout");
                Err(LinkError::timeout("TCP PDU read timeout"))
            },
        }
    }

    /// Shut the write half down; the socket closes on drop
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("TCP shutdown {}: {}", self.peer, e);
        }
        info!("TCP closed: {}", self.peer);
    }
}
