//! Wire protocol shared by the burrow broker and client.
//!
//! The control link between a client and the broker carries exactly one kind
//! of payload: the JSON [`Frame`] envelope. This crate defines that envelope,
//! the tunnel-identifier rules used as the routing key, and the hop-by-hop
//! header policy applied at both ends of the tunnel.

pub mod headers;
pub mod message;
pub mod tunnel_id;

pub use message::{Frame, FrameType};
pub use tunnel_id::InvalidTunnelId;
