//! Link-level error types shared by the protocol clients

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Field link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    /// Protocol-level errors (malformed or unexpected frames)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Modbus exception response
    #[error("Modbus exception: FC={function:02X} code={code:02X}")]
    ModbusException { function: u8, code: u8 },

    /// BACnet Error / Reject / Abort PDU
    #[error("BACnet error: {0}")]
    Bacnet(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LinkError::Timeout(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        LinkError::InvalidData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn bacnet(msg: impl Into<String>) -> Self {
        LinkError::Bacnet(msg.into())
    }

    /// Whether the session is unusable and must be re-established
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            LinkError::Connection(_)
                | LinkError::NotConnected
                | LinkError::Io(_)
                | LinkError::Timeout(_)
        )
    }
}
