//! The burrow tunnel client.
//!
//! Dials the broker, claims a tunnel id over a WebSocket control link, and
//! serves the broker's `request` frames from a local HTTP origin. The outer
//! loop reconnects with bounded exponential backoff until shutdown.

mod client;
mod connection;
mod handler;
mod runner;

pub use client::ClientConfig;
pub use connection::ConnectError;
pub use runner::run;
