//! Unified error handling for the alarm pipeline services
//!
//! Service crates keep their own narrow error types at protocol and
//! transport seams and convert into [`IgnisError`] at component boundaries.

use thiserror::Error;
use tracing::Level;

#[doc(hidden)]
pub use tracing;

// ============================================================================
// IgnisError - Main error type
// ============================================================================

/// Main error type for the alarm pipeline
#[derive(Debug, Error)]
pub enum IgnisError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Storage Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // ======================================
    // Field & Delivery Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Notification error: {channel}: {message}")]
    Notification { channel: String, message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Render error: {0}")]
    Render(String),
}

/// Result type alias using IgnisError
pub type IgnisResult<T> = Result<T, IgnisError>;

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Database,
    Network,
    Protocol,
    Render,
}

impl IgnisError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    pub fn notification(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Notification {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Stable error code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Notification { .. } => "NOTIFICATION_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::Render(_) => "RENDER_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Database(_) | Self::Redis(_) => ErrorCategory::Database,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Notification { .. } | Self::HttpClient(_) => ErrorCategory::Network,
            Self::Render(_) => ErrorCategory::Render,
        }
    }

    /// Storage and configuration failures lose data or stop the service
    pub fn log_level(&self) -> Level {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Database => Level::ERROR,
            ErrorCategory::Network | ErrorCategory::Protocol | ErrorCategory::Render => {
                Level::WARN
            },
        }
    }
}

/// Log an [`IgnisError`] at its level, tagged with its code
///
/// `log_error!(err, "Alarm {} not stored", id)`
#[macro_export]
macro_rules! log_error {
    ($err:expr, $($context:tt)+) => {{
        let err: &$crate::IgnisError = &$err;
        let context = format!($($context)+);
        if err.log_level() == $crate::tracing::Level::ERROR {
            $crate::tracing::error!("[{}] {}: {}", err.error_code(), context, err);
        } else {
            $crate::tracing::warn!("[{}] {}: {}", err.error_code(), context, err);
        }
    }};
}
