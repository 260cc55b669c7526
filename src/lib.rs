//! # call-bridge-backend
//!
//! Real-time audio bridge between a cloud telephony provider and an AI
//! audio pipeline (transcription → reasoning → speech synthesis).
//!
//! The provider reaches us twice per call: first over plain HTTP webhooks
//! (call setup and status callbacks), then over a JSON-over-WebSocket media
//! stream carrying base64 μ-law audio. The bridge terminates that framing,
//! converts between telephony audio (μ-law 8kHz) and pipeline audio (PCM16
//! 16kHz), and moves frames through bounded queues that drop rather than
//! stall when the consumer falls behind.
//!
//! ## Module map:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state (config, request metrics, registry)
//! - **bridge**: session queue pairs, per-session metrics, the registry
//! - **audio**: μ-law codec and resampler core
//! - **websocket**: the provider link state machine
//! - **handlers**: provider webhooks and bridge introspection endpoints
//! - **middleware**: request logging and endpoint metrics
//! - **error**: error taxonomy and HTTP error responses
//!
//! An AI pipeline integrates by looking a session up in the registry and
//! calling `subscribe_phone_to_pipeline` / `publish_pipeline_to_phone` on
//! it; everything else is internal plumbing.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
pub mod websocket;
