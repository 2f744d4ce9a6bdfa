//! CONNECT tunnel configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How CONNECT requests to matching hosts are handled.
///
/// Exactly one strategy is active per process. CONNECT requests to hosts
/// that do not match the destination pattern are always relayed as raw
/// bytes regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStrategy {
    /// Terminate TLS and dispatch decrypted requests through the proxy modes
    #[default]
    Intercept,
    /// Relay HTTP messages verbatim between client and target
    Relay,
}

impl TunnelStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStrategy::Intercept => "intercept",
            TunnelStrategy::Relay => "relay",
        }
    }
}

impl fmt::Display for TunnelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "intercept" => Ok(TunnelStrategy::Intercept),
            "relay" => Ok(TunnelStrategy::Relay),
            other => Err(format!(
                "unknown tunnel strategy '{other}', expected intercept or relay"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    #[serde(default)]
    pub strategy: TunnelStrategy,
    #[serde(default)]
    pub ca: CaConfig,
}

/// Certificate authority used to mint intercept certificates
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfig {
    /// CA certificate (PEM). Generated at startup when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    /// CA private key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Write the active CA certificate here so clients can trust it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}
