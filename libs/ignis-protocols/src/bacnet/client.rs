//! BACnet/IP client over one shared UDP socket
//!
//! A receive task routes replies to waiting requests and keeps the table of
//! devices that answered Who-Is. A reply reaches its request only when the
//! invoke id, sender address, object and property all match.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use super::codec::{
    decode_frame, decode_read_property_ack, encode_read_property, encode_who_is, Apdu, ObjectId,
    PropertyValue, PROPERTY_PRESENT_VALUE,
};
use crate::error::{LinkError, Result};

/// Device that answered a Who-Is
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub instance: u32,
    pub address: SocketAddr,
    pub max_apdu: u32,
    pub vendor_id: u32,
    pub last_seen: DateTime<Utc>,
}

/// Pause after a socket receive error
const RX_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Outstanding ReadProperty
struct PendingRead {
    peer: SocketAddr,
    object: ObjectId,
    property: u32,
    reply: oneshot::Sender<Apdu>,
}

impl PendingRead {
    /// Whether `apdu` from `src` answers this request
    fn accepts(&self, src: SocketAddr, apdu: &Apdu) -> bool {
        if src != self.peer {
            return false;
        }
        match apdu {
            Apdu::ComplexAck { payload, .. } => match decode_read_property_ack(payload) {
                Ok((object, property, _)) => object == self.object && property == self.property,
                // Malformed acks are reported by the caller
                Err(_) => true,
            },
            _ => true,
        }
    }
}

type Pending = Arc<DashMap<u8, PendingRead>>;

/// Shared BACnet/IP client
pub struct BacnetClient {
    socket: Arc<UdpSocket>,
    broadcast: SocketAddr,
    apdu_timeout: Duration,
    pending: Pending,
    devices: Arc<DashMap<u32, DiscoveredDevice>>,
    next_invoke: Mutex<u8>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BacnetClient {
    /// Bind the local UDP port and start the receive task
    pub async fn bind(
        local_port: u16,
        broadcast: SocketAddr,
        apdu_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))
            .await
            .map_err(|e| LinkError::connection(format!("BACnet bind :{local_port}: {e}")))?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        info!("BACnet bound: {}", socket.local_addr()?);

        let client = Arc::new(Self {
            socket: Arc::clone(&socket),
            broadcast,
            apdu_timeout,
            pending: Arc::new(DashMap::new()),
            devices: Arc::new(DashMap::new()),
            next_invoke: Mutex::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let recv = tokio::spawn(receive_loop(
            socket,
            Arc::clone(&client.pending),
            Arc::clone(&client.devices),
        ));
        client.tasks.lock().push(recv);
        Ok(client)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Broadcast a Who-Is
    pub async fn who_is(&self) -> Result<()> {
        self.socket
            .send_to(&encode_who_is(), self.broadcast)
            .await
            .map_err(|e| LinkError::io(format!("Who-Is send: {e}")))?;
        debug!("Who-Is -> {}", self.broadcast);
        Ok(())
    }

    /// Repeat Who-Is every `interval`, starting now
    pub fn start_discovery(self: &Arc<Self>, interval: Duration) {
        let client = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if let Err(e) = client.who_is().await {
                    warn!("Who-Is: {}", e);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by_key(|d| d.instance);
        devices
    }

    pub fn device(&self, instance: u32) -> Option<DiscoveredDevice> {
        self.devices.get(&instance).map(|d| d.value().clone())
    }

    fn allocate_invoke(&self, read: PendingRead) -> Result<u8> {
        let mut next = self.next_invoke.lock();
        for _ in 0..=u8::MAX {
            let id = *next;
            *next = next.wrapping_add(1);
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(read);
                return Ok(id);
            }
        }
        Err(LinkError::bacnet("No free invoke id"))
    }

    /// ReadProperty, bounded by the APDU timeout
    pub async fn read_property(
        &self,
        address: SocketAddr,
        object: ObjectId,
        property: u32,
    ) -> Result<PropertyValue> {
        let (tx, rx) = oneshot::channel();
        let invoke_id = self.allocate_invoke(PendingRead {
            peer: address,
            object,
            property,
            reply: tx,
        })?;
        let frame = encode_read_property(invoke_id, object, property);

        if let Err(e) = self.socket.send_to(&frame, address).await {
            self.pending.remove(&invoke_id);
            return Err(LinkError::io(format!("ReadProperty send {address}: {e}")));
        }

        let reply = match timeout(self.apdu_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(LinkError::bacnet("Receive task stopped")),
            Err(_) => {
                self.pending.remove(&invoke_id);
                return Err(LinkError::timeout(format!(
                    "ReadProperty {}:{} on {}",
                    object.object_type, object.instance, address
                )));
            },
        };

        match reply {
            Apdu::ComplexAck { payload, .. } => {
                let (_, _, value) = decode_read_property_ack(&payload)?;
                Ok(value)
            },
            Apdu::Error { class, code, .. } => Err(LinkError::bacnet(format!(
                "Error class={class} code={code}"
            ))),
            Apdu::Reject { reason, .. } => {
                Err(LinkError::bacnet(format!("Reject reason={reason}")))
            },
            Apdu::Abort { reason, .. } => Err(LinkError::bacnet(format!("Abort reason={reason}"))),
            other => Err(LinkError::protocol(format!("Unexpected reply: {other:?}"))),
        }
    }

    /// Present value of a binary point
    pub async fn read_present_value(&self, address: SocketAddr, object: ObjectId) -> Result<bool> {
        let value = self
            .read_property(address, object, PROPERTY_PRESENT_VALUE)
            .await?;
        value
            .as_bool()
            .ok_or_else(|| LinkError::invalid_data(format!("Non-binary present value: {value:?}")))
    }

    /// Stop the receive and discovery tasks
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.clear();
        info!("BACnet client stopped");
    }
}

impl Drop for BacnetClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    pending: Pending,
    devices: Arc<DashMap<u32, DiscoveredDevice>>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP unreachable surfaces here on some platforms
                debug!("BACnet RX: {}", e);
                sleep(RX_ERROR_BACKOFF).await;
                continue;
            },
        };

        let apdu = match decode_frame(&buf[..len]) {
            Ok(apdu) => apdu,
            Err(e) => {
                trace!("BACnet RX {}: {}", src, e);
                continue;
            },
        };

        if let Apdu::IAm(iam) = &apdu {
            let instance = iam.device.instance;
            let is_new = !devices.contains_key(&instance);
            devices.insert(
                instance,
                DiscoveredDevice {
                    instance,
                    address: src,
                    max_apdu: iam.max_apdu,
                    vendor_id: iam.vendor_id,
                    last_seen: Utc::now(),
                },
            );
            if is_new {
                info!("BACnet device {} @ {}", instance, src);
            }
            continue;
        }

        let Some(invoke_id) = apdu.invoke_id() else {
            continue;
        };
        match pending.remove_if(&invoke_id, |_, read| read.accepts(src, &apdu)) {
            Some((_, read)) => {
                let _ = read.reply.send(apdu);
            },
            None if pending.contains_key(&invoke_id) => {
                debug!("BACnet reply invoke={} from {} does not match request", invoke_id, src);
            },
            None => trace!("BACnet late reply invoke={}", invoke_id),
        }
    }
}
