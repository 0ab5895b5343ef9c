//! Infrastructure-backed bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `payflow-events`; this
//! module adds transports that need a network client.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsError};
