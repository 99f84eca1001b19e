//! Software demultiplexer for MPEG transport streams and DVB-S2 base-band
//! frames.
//!
//! A [`Demux`] takes a raw byte stream (188 or 204 byte packets, single
//! base-band frames or a continuous base-band stream) and fans it out to
//! registered feeds:
//!
//! - TS feeds receive whole packets or packet payloads of one PID, or of
//!   every PID when set to [`PID_WILDCARD`].
//! - Section feeds reassemble PSI/SI sections of one PID and run them through
//!   a chain of [`SectionFilter`] rules.
//! - Base-band feeds receive frames, data fields or reassembled user packets
//!   of one input stream.
//!
//! # Feed Lifecycle
//!
//! ```text
//! allocate -> set -> start_filtering -> (data) -> stop_filtering -> release
//!   Allocated  Ready      Go                        Ready             Free
//! ```
//!
//! Starting and stopping goes through the [`DemuxHooks`] of the data source.
//! [`SoftwareHooks`] accepts every request.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use swdemux::{Demux, DemuxConfig, DmxStatus, SoftwareHooks, TsFeedHandle, TsFeedParams, TsType};
//!
//! let demux = Demux::with_hooks(DemuxConfig::default(), Arc::new(SoftwareHooks));
//! let feed = demux
//!     .allocate_ts_feed(Box::new(|packet: &[u8], _: TsFeedHandle, _: DmxStatus| {
//!         assert_eq!(packet.len(), 188);
//!     }))
//!     .unwrap();
//! demux.set_ts_feed(feed, TsFeedParams::new(0x0100, TsType::PACKET)).unwrap();
//! demux.start_filtering(feed).unwrap();
//!
//! let mut packet = [0xFFu8; 188];
//! packet[..4].copy_from_slice(&[0x47, 0x01, 0x00, 0x10]);
//! demux.swfilter(&packet);
//! assert_eq!(demux.stats().packets, 1);
//! ```

pub mod bbframe;
pub mod config;
pub mod crc;
pub mod error;
pub mod feed;
pub mod filter;
pub mod hooks;
pub mod packet;
pub mod stats;

mod demux;
mod dispatch;
mod framer;
mod section;

pub use bbframe::{BbFrameError, BbHeader, BbIsi, BbMode, StreamType, BB_HEADER_LEN, BB_MAX_FRAME_LEN};
pub use config::DemuxConfig;
pub use demux::Demux;
pub use error::{DemuxError, Result};
pub use feed::{
    BbCallback, BbFeedHandle, BbFeedParams, DmxStatus, FeedHandle, FeedState, FilterHandle, PesType,
    SectionCallback, SectionFeedHandle, TsCallback, TsFeedHandle, TsFeedParams, TsType, PES_SLOT_COUNT,
};
pub use filter::{SectionFilter, FILTER_SIZE};
pub use framer::FrameFormat;
pub use hooks::{DemuxHooks, FeedInfo, FeedKind, SoftwareHooks};
pub use packet::{MAX_PID, PID_WILDCARD, SYNC_BYTE, TS_PACKET_SIZE, TS_PACKET_SIZE_204};
pub use section::MAX_SECTION_SIZE;
pub use stats::DemuxStats;
