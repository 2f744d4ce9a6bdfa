//! Prometheus counters for hoverfly-proxy.
//!
//! Counts completed responses per proxy mode. The counter owns its registry
//! so several proxies in one process (tests, embedding) never share counts.

use crate::mode::ProxyMode;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Per-mode response counter
pub struct ModeCounter {
    registry: Registry,
    counts: IntCounterVec,
}

impl ModeCounter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counts = IntCounterVec::new(
            Opts::new(
                "hoverfly_mode_requests_total",
                "Total number of responses produced, by proxy mode active at dispatch",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(counts.clone()))?;

        // Export every mode, even before its first request
        for mode in ProxyMode::ALL {
            counts.with_label_values(&[mode.as_str()]);
        }

        Ok(Self { registry, counts })
    }

    /// Record one completed response for `mode`.
    pub fn count(&self, mode: ProxyMode) {
        self.counts.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn get(&self, mode: ProxyMode) -> u64 {
        self.counts.with_label_values(&[mode.as_str()]).get()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        ProxyMode::ALL
            .iter()
            .map(|mode| (mode.as_str().to_string(), self.get(*mode)))
            .collect()
    }

    /// Render all counters in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Periodically log the counters.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = counter.snapshot();
                info!(
                    simulate = snapshot["simulate"],
                    synthesize = snapshot["synthesize"],
                    modify = snapshot["modify"],
                    capture = snapshot["capture"],
                    "Mode counters"
                );
            }
        })
    }
}
