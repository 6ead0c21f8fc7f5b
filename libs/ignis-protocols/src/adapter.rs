//! Adapter contract shared by the field protocol clients
//!
//! A poller drives any [`PointAdapter`] the same way: connect, poll on a
//! timer, disconnect. Protocol calling conventions stay behind this seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

// ============================================================================
// Connection State
// ============================================================================

/// Connection state of a monitored site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No session, or waiting for a reconnect
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Session established and polling
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

// ============================================================================
// Poll results
// ============================================================================

/// One logical point sampled during a poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointReading {
    /// Logical signal name
    pub name: String,
    /// Raw protocol address (register / bit offset or object instance)
    pub address: u32,
    /// Sampled boolean value
    pub value: bool,
}

impl PointReading {
    pub fn new(name: impl Into<String>, address: u32, value: bool) -> Self {
        Self {
            name: name.into(),
            address,
            value,
        }
    }
}

/// A poll cycle that failed part-way
///
/// `partial` holds the points read before the failure; they are still valid.
#[derive(Debug, Clone)]
pub struct PollFailure {
    pub partial: Vec<PointReading>,
    pub error: LinkError,
}

impl PollFailure {
    pub fn new(partial: Vec<PointReading>, error: LinkError) -> Self {
        Self { partial, error }
    }
}

impl From<LinkError> for PollFailure {
    fn from(error: LinkError) -> Self {
        Self {
            partial: Vec::new(),
            error,
        }
    }
}

// ============================================================================
// Adapter trait
// ============================================================================

/// Result-returning protocol adapter
#[async_trait]
pub trait PointAdapter: Send + Sync + 'static {
    /// Site descriptor: address plus read mapping
    type Target: Send + Sync + Clone + 'static;
    /// Live session owned by one site's poll loop
    type Session: Send + 'static;

    /// Protocol name for logging
    fn protocol(&self) -> &'static str;

    /// Printable endpoint of a target
    fn endpoint(&self, target: &Self::Target) -> String;

    /// Open a session to the site
    async fn connect(&self, target: &Self::Target) -> Result<Self::Session>;

    /// Sample every mapped point once
    async fn poll(
        &self,
        session: &mut Self::Session,
    ) -> std::result::Result<Vec<PointReading>, PollFailure>;

    /// Close the session
    async fn disconnect(&self, session: Self::Session);
}
