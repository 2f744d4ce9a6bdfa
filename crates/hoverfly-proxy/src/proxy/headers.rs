//! Header helpers for proxied messages.

/// Headers scoped to a single connection hop (RFC 9110 section 7.6.1),
/// plus the non-standard `proxy-connection`.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Case-insensitive hop-by-hop check.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}
