//! Realtime modules.
//!
//! - `client`: connection lifecycle, keepalive, reconnection, and dispatch.
//! - `proto`: wire messages shared with the realtime service.
//! - `registry`: subscriber registry the client fans events out to.

/// Websocket connection worker and its handle.
pub mod client;
/// Realtime wire protocol messages.
pub mod proto;
/// Event subscriber registry.
pub mod registry;
