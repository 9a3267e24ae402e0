//! Shared identifiers and tracing setup used by every hubwire crate.

pub mod ids;
pub mod tracing;

pub use ids::{ConnectionId, IdentityToken, InstanceId};
pub use tracing::{LogFormat, TracingConfig, TracingError, init_tracing};
