//! BACnet/IP client (Who-Is discovery, ReadProperty polling)

pub mod adapter;
pub mod client;
pub mod codec;

pub use adapter::{BacnetAdapter, BacnetPoint, BacnetSession, BacnetTarget};
pub use client::{BacnetClient, DiscoveredDevice};
pub use codec::{ObjectId, ObjectType, PropertyValue};

/// Well-known BACnet/IP port devices listen on
pub const DEFAULT_DEVICE_PORT: u16 = 47808;
/// Local port the client binds, distinct from 47808 so a co-located device stack can run
pub const DEFAULT_LOCAL_PORT: u16 = 47809;
