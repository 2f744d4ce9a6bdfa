//! Proxy mode definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Active traffic-handling strategy.
///
/// Exactly one mode is observed per request; the dispatcher matches on it
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProxyMode {
    /// Replay captured responses from the cache
    #[default]
    Simulate = 0,
    /// Every response is produced by middleware, no upstream traffic
    Synthesize = 1,
    /// Middleware rewrites the outgoing request and the incoming response
    Modify = 2,
    /// Forward to the real backend and store every round trip
    Capture = 3,
}

impl ProxyMode {
    pub const ALL: [ProxyMode; 4] = [
        ProxyMode::Simulate,
        ProxyMode::Synthesize,
        ProxyMode::Modify,
        ProxyMode::Capture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Simulate => "simulate",
            ProxyMode::Synthesize => "synthesize",
            ProxyMode::Modify => "modify",
            ProxyMode::Capture => "capture",
        }
    }

    /// Whether this mode cannot work without a middleware.
    pub fn requires_middleware(&self) -> bool {
        matches!(self, ProxyMode::Synthesize | ProxyMode::Modify)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ProxyMode::Synthesize,
            2 => ProxyMode::Modify,
            3 => ProxyMode::Capture,
            _ => ProxyMode::Simulate,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulate" => Ok(ProxyMode::Simulate),
            "synthesize" => Ok(ProxyMode::Synthesize),
            "modify" => Ok(ProxyMode::Modify),
            "capture" => Ok(ProxyMode::Capture),
            other => Err(format!(
                "unknown mode '{other}', expected one of: simulate, synthesize, modify, capture"
            )),
        }
    }
}
