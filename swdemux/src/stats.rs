//! Aggregate packet-path statistics.
//!
//! Stream corruption never produces an error value on the ingestion path; it
//! only shows up here.

use log::info;
use serde::Serialize;

/// Counters maintained under the packet lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DemuxStats {
    /// Packets handed to the dispatcher.
    pub packets: u64,
    /// Bytes skipped by the framer while searching for a sync byte.
    pub lost_bytes: u64,
    /// Pre-aligned packets skipped because of a bad sync byte.
    pub bad_sync_packets: u64,
    /// Packets with the transport error indicator set.
    pub tei_packets: u64,
    /// Continuity counter mismatches seen by the TS check.
    pub cc_errors: u64,
    /// Section discontinuities (counter jump or discontinuity indicator).
    pub section_discontinuities: u64,
    /// Sections handed to the filter chain.
    pub sections: u64,
    /// Sections dropped for a failing CRC-32.
    pub section_crc_errors: u64,
    /// Section bytes dropped because the reassembly buffer was full.
    pub section_overflow_bytes: u64,
    /// PUSI packets whose pointer field pointed outside the payload.
    pub pointer_errors: u64,
    /// Base-band frames accepted.
    pub bb_frames: u64,
    /// Base-band frames rejected (header CRC, length or mode).
    pub bb_frame_errors: u64,
    /// Bytes skipped by the base-band stream framer.
    pub bb_lost_bytes: u64,
    /// User packets dropped for a failing CRC-8.
    pub bb_crc_errors: u64,
    /// User packet fragments discarded during reassembly.
    pub bb_fragment_drops: u64,
    /// Last measured input rate in kbit/s, when the speed check is enabled.
    pub speed_kbps: Option<u64>,
}

impl DemuxStats {
    /// Print a human-readable statistics report.
    pub fn print_report(&self) {
        info!(
            "Demux Report: packets={}, lost_bytes={}, bad_sync={}, tei={}, cc_errors={}",
            self.packets, self.lost_bytes, self.bad_sync_packets, self.tei_packets, self.cc_errors
        );
        info!(
            "Sections: delivered={}, crc_errors={}, discontinuities={}, overflow_bytes={}, pointer_errors={}",
            self.sections,
            self.section_crc_errors,
            self.section_discontinuities,
            self.section_overflow_bytes,
            self.pointer_errors
        );
        if self.bb_frames > 0 || self.bb_frame_errors > 0 || self.bb_lost_bytes > 0 {
            info!(
                "Base-band: frames={}, frame_errors={}, lost_bytes={}, up_crc_errors={}, fragment_drops={}",
                self.bb_frames,
                self.bb_frame_errors,
                self.bb_lost_bytes,
                self.bb_crc_errors,
                self.bb_fragment_drops
            );
        }
        if let Some(kbps) = self.speed_kbps {
            info!("Input rate: {} kbit/s", kbps);
        }
    }
}
