//! Modbus TCP client (read function codes 0x01-0x04)

pub mod adapter;
pub mod connection;
pub mod pdu;

pub use adapter::{ModbusAdapter, ModbusSession, ModbusTarget, ReadMapping};
pub use connection::ModbusTcpClient;
pub use pdu::{ModbusPdu, RegionKind};

/// Protocol constants
pub mod constants {
    /// MBAP header: transaction id (2), protocol id (2), length (2), unit id (1)
    pub const MBAP_HEADER_LEN: usize = 7;
    /// Unit id plus the largest PDU
    pub const MAX_MBAP_LENGTH: usize = 254;
    pub const MAX_PDU_SIZE: usize = 253;
    pub const MODBUS_PROTOCOL_ID: u16 = 0;
    pub const MAX_READ_BITS: u16 = 2000;
    pub const MAX_READ_REGISTERS: u16 = 125;
    pub const DEFAULT_PORT: u16 = 502;
    pub const DEFAULT_UNIT_ID: u8 = 1;
}
