//! Demultiplexer configuration.

use serde::Deserialize;

/// Default number of feed slots.
pub const DEFAULT_FEED_COUNT: usize = 256;

/// Default number of filter slots.
pub const DEFAULT_FILTER_COUNT: usize = 256;

/// Packets between two speed reports.
pub const DEFAULT_SPEED_INTERVAL: u64 = 50_000;

/// Construction-time settings of a [`crate::Demux`].
///
/// Loaded from the `[demux]` table of a TOML configuration file, every field
/// may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Number of feed slots allocated at construction.
    pub feed_count: usize,
    /// Number of filter slots allocated at construction.
    pub filter_count: usize,
    /// Check per-PID continuity counters and log mismatches.
    pub ts_check: bool,
    /// Periodically compute and log the input bitrate.
    pub speed_check: bool,
    /// Packets between two bitrate samples.
    pub speed_interval: u64,
    /// Dispatch packets that carry the transport error indicator.
    pub feed_error_packets: bool,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            feed_count: DEFAULT_FEED_COUNT,
            filter_count: DEFAULT_FILTER_COUNT,
            ts_check: false,
            speed_check: false,
            speed_interval: DEFAULT_SPEED_INTERVAL,
            feed_error_packets: true,
        }
    }
}
