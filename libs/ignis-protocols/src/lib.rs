//! Field protocol clients for the alarm pipeline
//!
//! Both protocols sit behind [`PointAdapter`]: connect a site, poll its
//! mapped points as booleans, disconnect. Pollers never see protocol
//! calling conventions.

pub mod adapter;
pub mod bacnet;
pub mod error;
pub mod modbus;

pub use adapter::{ConnectionState, PointAdapter, PointReading, PollFailure};
pub use error::{LinkError, Result};
