//! Hop-by-hop header policy.
//!
//! These headers describe one HTTP connection, not the request itself, so
//! they must not cross the tunnel in either direction.

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Case-insensitive membership test against the hop-by-hop set.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
