//! Network statistics sink

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

/// Consumer of periodic network samples
///
/// Implementations must not fail or block: the sampler never looks at the
/// outcome.
pub trait StatsRecorder: Send + Sync {
    /// Record one sample
    fn record_network_stats(&self, hashrate: f64, block_count: u64, difficulty: f64);
}

/// One network sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NetworkSample {
    pub hashrate: f64,
    pub block_count: u64,
    pub difficulty: f64,
}

/// Keeps the most recent network sample in memory
#[derive(Debug, Default)]
pub struct NetworkStats {
    latest: RwLock<Option<NetworkSample>>,
    print: bool,
}

impl NetworkStats {
    /// Create the recorder; `print` logs every sample at info level
    pub fn new(print: bool) -> Self {
        Self {
            latest: RwLock::new(None),
            print,
        }
    }

    /// Most recent sample, if any was recorded
    pub fn latest(&self) -> Option<NetworkSample> {
        *self.latest.read()
    }
}

impl StatsRecorder for NetworkStats {
    fn record_network_stats(&self, hashrate: f64, block_count: u64, difficulty: f64) {
        *self.latest.write() = Some(NetworkSample {
            hashrate,
            block_count,
            difficulty,
        });
        if self.print {
            info!(
                "network hashrate: {}, blocks: {}, difficulty: {:.2}",
                format_hashrate(hashrate),
                block_count,
                difficulty
            );
        }
    }
}

/// Render a hashrate with an SI prefix, e.g. `1.50 TH/s`
pub fn format_hashrate(hashrate: f64) -> String {
    const UNITS: [&str; 7] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
    let mut value = hashrate;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
