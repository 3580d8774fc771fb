//! User-facing Rust SDK for the PulseDesk realtime event stream and
//! session APIs.
//!
//! The crate is organized by transport surface:
//! - `session_api`: HTTP client for the current-user session check.
//! - `realtime`: realtime websocket client, wire protocol types, and the
//!   subscriber registry.
//! - `retry`: shared retry and backoff utilities.

/// Realtime websocket client, protocol types, and subscriber registry.
pub mod realtime;
/// Retry and backoff helpers used across the SDK.
pub mod retry;
/// Session check HTTP client and the collaborator trait it implements.
pub mod session_api;
