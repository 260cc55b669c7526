//! # Audio Stream Bridge
//!
//! Bidirectional audio routing between phone calls and the AI pipeline.
//!
//! ## Key Components:
//! - **Session**: one queue pair per live call, with lifecycle flags and
//!   drop-on-overflow backpressure
//! - **Metrics**: per-session packet/byte/latency counters behind an
//!   internal lock, exported as plain snapshots
//! - **Registry**: process-wide session map, root cancellation scope, and
//!   the per-call routing tasks spawned when a provider link binds
//!
//! The WebSocket side of a call lives in `crate::websocket`; the HTTP
//! webhook surface lives in `crate::handlers`. Both reach sessions only
//! through the registry.

pub mod metrics;
pub mod registry;
pub mod session;
