//! Real-time canvas coordinator and WebSocket gateway.
//!
//! The coordinator tracks which connection belongs to which participant and
//! group, applies paints under per-participant rate limits, and fans group
//! events out to every member connection.

pub mod connection;
pub mod error;
pub mod events;
pub mod group;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod state;

pub use error::CoordinatorError;
pub use group::{Group, GroupKind, GroupSpec, GroupSummary, PaintOutcome};
pub use registry::CoordinatorRegistry;
pub use server::{build_router, start_gateway};
pub use state::GatewayState;
