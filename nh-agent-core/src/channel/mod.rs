//! The WebSocket channel client: connection lifecycle, topic multiplexing,
//! and the per-topic event handlers, per spec 4.1.

pub mod auth;
pub mod client;
pub mod console;
pub mod extensions;
pub mod protocol;
pub mod script_runner;

pub use client::ChannelClient;
