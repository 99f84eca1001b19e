//! Collaborator hooks.
//!
//! A hardware driver or a higher layer plugs into the demux through
//! [`DemuxHooks`]. `start_feed`/`stop_feed` run under the admin lock;
//! the remaining hooks run on the packet path under the packet lock and must
//! not block or call back into the same [`crate::Demux`].

use std::time::Duration;

use log::debug;

use crate::bbframe::BbIsi;
use crate::crc::crc32_mpeg2;
use crate::error::Result;

/// Kind of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Raw packet / payload / decoder feed.
    Ts,
    /// Section feed.
    Section,
    /// Base-band feed.
    BaseBand,
}

/// Description of a feed passed to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedInfo {
    /// Slot index in the feed pool.
    pub index: usize,
    pub kind: FeedKind,
    /// Selected PID (TS and section feeds).
    pub pid: Option<u16>,
    /// Selected input stream (base-band feeds).
    pub isi: Option<BbIsi>,
    /// Buffer size requested by the owner (0 when none).
    pub buffer_size: usize,
    /// Delivery timeout requested by the owner. Stored, not enforced.
    pub timeout: Option<Duration>,
}

/// Callbacks into the collaborator owning the data source.
pub trait DemuxHooks: Send + Sync {
    /// Called when a feed starts filtering. An error aborts the start.
    fn start_feed(&self, feed: &FeedInfo) -> Result<()>;

    /// Called when a feed stops filtering. The stop completes regardless.
    fn stop_feed(&self, feed: &FeedInfo) -> Result<()>;

    /// Hand a packet to a hardware decoder (decoder feeds only).
    fn write_to_decoder(&self, _feed: &FeedInfo, _packet: &[u8]) {}

    /// Checksum of a complete section including its CRC field. 0 means valid.
    fn check_crc32(&self, _feed: &FeedInfo, section: &[u8]) -> u32 {
        crc32_mpeg2(section)
    }

    /// Copy reassembly data. `dst` and `src` have the same length.
    fn memcopy(&self, _feed: &FeedInfo, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }
}

/// Hooks for a purely software data source: start and stop always succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareHooks;

impl DemuxHooks for SoftwareHooks {
    fn start_feed(&self, feed: &FeedInfo) -> Result<()> {
        debug!("start feed {} ({:?})", feed.index, feed.kind);
        Ok(())
    }

    fn stop_feed(&self, feed: &FeedInfo) -> Result<()> {
        debug!("stop feed {} ({:?})", feed.index, feed.kind);
        Ok(())
    }
}
