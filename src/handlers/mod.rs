//! # HTTP Request Handlers
//!
//! Webhook and status endpoints for the telephony provider. The provider
//! drives call setup over plain HTTP (form-encoded webhooks); the actual
//! audio flows over the WebSocket endpoint in `crate::websocket`.

pub mod calls;

pub use calls::*;
