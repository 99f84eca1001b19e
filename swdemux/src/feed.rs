//! Feed and filter registry.
//!
//! All slots are created once with the demux. A handle carries the slot index
//! and the slot generation; the generation is bumped whenever a slot returns
//! to the free pool, so a handle kept past its release is rejected instead of
//! silently addressing the next owner of the slot.

use std::fmt;
use std::mem;
use std::time::Duration;

use crate::bbframe::{BbIsi, BbMode, UpCursor};
use crate::error::{DemuxError, Result};
use crate::filter::{PreparedFilter, SectionFilter};
use crate::hooks::{FeedInfo, FeedKind};
use crate::section::SectionReassembler;

/// Number of decoder PES slots.
pub const PES_SLOT_COUNT: usize = 20;

/// Slot address shared by all handle types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u32,
}

impl SlotId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in its pool.
    pub fn index(self) -> usize {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

macro_rules! slot_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) SlotId);

        impl $name {
            pub fn index(self) -> usize {
                self.0.index
            }

            pub fn generation(self) -> u32 {
                self.0.generation
            }
        }
    };
}

slot_handle!(
    /// Handle of a raw packet / payload / decoder feed.
    TsFeedHandle
);
slot_handle!(
    /// Handle of a section feed.
    SectionFeedHandle
);
slot_handle!(
    /// Handle of a base-band feed.
    BbFeedHandle
);
slot_handle!(
    /// Handle of a section filter. Passed to the section callback on a match.
    FilterHandle
);

mod private {
    pub trait Sealed {}
    impl Sealed for super::TsFeedHandle {}
    impl Sealed for super::SectionFeedHandle {}
    impl Sealed for super::BbFeedHandle {}
}

/// Feed handles accepted by `start_filtering` / `stop_filtering`.
pub trait FeedHandle: Copy + private::Sealed {
    /// Kind of feed the handle refers to.
    const KIND: FeedKind;

    #[doc(hidden)]
    fn slot(self) -> SlotId;
}

impl FeedHandle for TsFeedHandle {
    const KIND: FeedKind = FeedKind::Ts;

    fn slot(self) -> SlotId {
        self.0
    }
}

impl FeedHandle for SectionFeedHandle {
    const KIND: FeedKind = FeedKind::Section;

    fn slot(self) -> SlotId {
        self.0
    }
}

impl FeedHandle for BbFeedHandle {
    const KIND: FeedKind = FeedKind::BaseBand;

    fn slot(self) -> SlotId {
        self.0
    }
}

/// Feed lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeedState {
    Free,
    Allocated,
    Ready,
    Go,
}

bitflags::bitflags! {
    /// What a TS feed receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TsType: u8 {
        /// Deliver packets to the callback.
        const PACKET = 0x01;
        /// Strip the header and adaptation field before delivery.
        const PAYLOAD_ONLY = 0x02;
        /// Hand packets to the decoder hook.
        const DECODER = 0x04;
        /// Packets are demultiplexed further by the owner; not a capture feed.
        const DEMUX = 0x08;
    }
}

/// Decoder PES slot claimed by a decoder feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PesType {
    Audio0,
    Video0,
    Teletext0,
    Subtitle0,
    Pcr0,
    Audio1,
    Video1,
    Teletext1,
    Subtitle1,
    Pcr1,
    Audio2,
    Video2,
    Teletext2,
    Subtitle2,
    Pcr2,
    Audio3,
    Video3,
    Teletext3,
    Subtitle3,
    Pcr3,
    /// No decoder slot.
    Other,
}

impl PesType {
    /// Index in the PES table, `None` for [`PesType::Other`].
    pub fn slot(self) -> Option<usize> {
        match self {
            PesType::Other => None,
            other => Some(other as usize),
        }
    }
}

/// Delivery status passed to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmxStatus {
    Ok,
    LengthError,
    Overrun,
    CrcError,
    FrameError,
    FifoError,
    Missed,
}

/// Receives packets (or payloads) of a TS feed.
pub type TsCallback = Box<dyn FnMut(&[u8], TsFeedHandle, DmxStatus) + Send>;

/// Receives every section matching one of the feed's filters.
pub type SectionCallback = Box<dyn FnMut(&[u8], FilterHandle, DmxStatus) + Send>;

/// Receives frames, data fields or verified user packet buffers together with
/// the stored user packet length (0 for frames and data fields).
pub type BbCallback = Box<dyn FnMut(&[u8], usize, BbFeedHandle, DmxStatus) + Send>;

/// Parameters of `set_ts_feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsFeedParams {
    /// PID to select, or 0x2000 for every packet.
    pub pid: u16,
    pub ts_type: TsType,
    pub pes_type: PesType,
    pub buffer_size: usize,
    pub timeout: Option<Duration>,
}

impl TsFeedParams {
    /// Feed without a decoder slot, buffer or timeout.
    pub fn new(pid: u16, ts_type: TsType) -> Self {
        Self {
            pid,
            ts_type,
            pes_type: PesType::Other,
            buffer_size: 0,
            timeout: None,
        }
    }
}

/// Parameters of `set_bb_feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbFeedParams {
    pub isi: BbIsi,
    pub mode: BbMode,
    /// Reassembly buffer size. Required for packetized modes.
    pub buffer_size: usize,
    pub timeout: Option<Duration>,
}

impl BbFeedParams {
    pub fn new(isi: BbIsi, mode: BbMode, buffer_size: usize) -> Self {
        Self {
            isi,
            mode,
            buffer_size,
            timeout: None,
        }
    }
}

pub(crate) struct TsFeed {
    pub pid: Option<u16>,
    pub ts_type: TsType,
    pub pes_type: PesType,
    pub peslen: u16,
    pub buffer_size: usize,
    pub timeout: Option<Duration>,
    /// Filter slot reserved at allocation.
    pub filter: SlotId,
    pub callback: TsCallback,
}

impl TsFeed {
    pub fn new(filter: SlotId, callback: TsCallback) -> Self {
        Self {
            pid: None,
            ts_type: TsType::default(),
            pes_type: PesType::Other,
            peslen: 0,
            buffer_size: 0,
            timeout: None,
            filter,
            callback,
        }
    }

    pub fn info(&self, index: usize) -> FeedInfo {
        FeedInfo {
            index,
            kind: FeedKind::Ts,
            pid: self.pid,
            isi: None,
            buffer_size: self.buffer_size,
            timeout: self.timeout,
        }
    }

    /// Capture feeds get each packet at most once, however many PIDs they
    /// share with other capture feeds.
    pub fn is_capture(&self) -> bool {
        self.ts_type.contains(TsType::PACKET) && !self.ts_type.contains(TsType::DEMUX)
    }
}

pub(crate) struct SectionFeed {
    pub pid: Option<u16>,
    pub check_crc: bool,
    pub buffer_size: usize,
    /// Filter slot indices, oldest first.
    pub filters: Vec<usize>,
    pub reassembler: SectionReassembler,
    pub callback: SectionCallback,
}

impl SectionFeed {
    pub fn new(filter_capacity: usize, callback: SectionCallback) -> Self {
        Self {
            pid: None,
            check_crc: false,
            buffer_size: 0,
            filters: Vec::with_capacity(filter_capacity),
            reassembler: SectionReassembler::new(),
            callback,
        }
    }

    pub fn info(&self, index: usize) -> FeedInfo {
        FeedInfo {
            index,
            kind: FeedKind::Section,
            pid: self.pid,
            isi: None,
            buffer_size: self.buffer_size,
            timeout: None,
        }
    }
}

/// Where a base-band feed's output goes.
pub(crate) enum BbSink {
    Callback(BbCallback),
    /// Verified 188-byte user packets go back into the packet dispatcher.
    TsCompat,
}

pub(crate) struct BbFeed {
    pub isi: Option<BbIsi>,
    pub mode: BbMode,
    pub buffer: Vec<u8>,
    pub cursor: UpCursor,
    pub timeout: Option<Duration>,
    pub sink: BbSink,
}

impl BbFeed {
    pub fn new(sink: BbSink) -> Self {
        Self {
            isi: None,
            mode: BbMode::Frame,
            buffer: Vec::new(),
            cursor: UpCursor::default(),
            timeout: None,
            sink,
        }
    }

    pub fn info(&self, index: usize) -> FeedInfo {
        FeedInfo {
            index,
            kind: FeedKind::BaseBand,
            pid: None,
            isi: self.isi,
            buffer_size: self.buffer.len(),
            timeout: self.timeout,
        }
    }
}

/// Per-kind feed state.
pub(crate) enum FeedData {
    Vacant,
    Ts(TsFeed),
    Section(SectionFeed),
    Bb(BbFeed),
}

impl FeedData {
    pub fn kind(&self) -> Option<FeedKind> {
        match self {
            FeedData::Vacant => None,
            FeedData::Ts(_) => Some(FeedKind::Ts),
            FeedData::Section(_) => Some(FeedKind::Section),
            FeedData::Bb(_) => Some(FeedKind::BaseBand),
        }
    }

    /// PID selector of TS and section feeds.
    pub fn pid(&self) -> Option<u16> {
        match self {
            FeedData::Ts(ts) => ts.pid,
            FeedData::Section(sec) => sec.pid,
            _ => None,
        }
    }
}

pub(crate) struct FeedSlot {
    pub generation: u32,
    pub state: FeedState,
    pub data: FeedData,
}

impl FeedSlot {
    fn vacant() -> Self {
        Self {
            generation: 0,
            state: FeedState::Free,
            data: FeedData::Vacant,
        }
    }

    /// Description handed to hooks.
    pub fn info(&self, index: usize) -> FeedInfo {
        match &self.data {
            FeedData::Ts(ts) => ts.info(index),
            FeedData::Section(sec) => sec.info(index),
            FeedData::Bb(bb) => bb.info(index),
            FeedData::Vacant => FeedInfo {
                index,
                kind: FeedKind::Ts,
                pid: None,
                isi: None,
                buffer_size: 0,
                timeout: None,
            },
        }
    }
}

/// Fixed set of feed slots.
pub(crate) struct FeedPool {
    slots: Vec<FeedSlot>,
}

impl FeedPool {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| FeedSlot::vacant()).collect(),
        }
    }

    /// Claim the first free slot for `data`.
    ///
    /// On exhaustion `data` is handed back so the caller can drop it outside
    /// the packet lock.
    pub fn allocate(&mut self, data: FeedData) -> std::result::Result<SlotId, FeedData> {
        let Some(index) = self.slots.iter().position(|s| s.state == FeedState::Free) else {
            return Err(data);
        };

        let slot = &mut self.slots[index];
        slot.state = FeedState::Allocated;
        slot.data = data;
        Ok(SlotId::new(index, slot.generation))
    }

    /// Validate a handle against the pool.
    pub fn get(&self, id: SlotId, kind: FeedKind) -> Result<&FeedSlot> {
        match self.slots.get(id.index) {
            Some(slot)
                if slot.generation == id.generation
                    && slot.state != FeedState::Free
                    && slot.data.kind() == Some(kind) =>
            {
                Ok(slot)
            }
            _ => Err(stale(id)),
        }
    }

    pub fn get_mut(&mut self, id: SlotId, kind: FeedKind) -> Result<&mut FeedSlot> {
        match self.slots.get_mut(id.index) {
            Some(slot)
                if slot.generation == id.generation
                    && slot.state != FeedState::Free
                    && slot.data.kind() == Some(kind) =>
            {
                Ok(slot)
            }
            _ => Err(stale(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slot by index, for the packet path. The index comes from the active
    /// list and is always in range.
    pub fn slot(&self, index: usize) -> &FeedSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FeedSlot {
        &mut self.slots[index]
    }

    /// Return a validated slot to the free pool and hand back its data.
    pub fn release(&mut self, id: SlotId) -> FeedData {
        let slot = &mut self.slots[id.index];
        slot.state = FeedState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        mem::replace(&mut slot.data, FeedData::Vacant)
    }
}

/// Filter slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterState {
    Free,
    /// Reserved by a TS feed.
    Allocated,
    /// Attached to a section feed's chain.
    Ready,
}

pub(crate) struct FilterSlot {
    pub generation: u32,
    pub state: FilterState,
    /// Feed slot index of the owner.
    pub owner: Option<usize>,
    pub rule: SectionFilter,
    pub prepared: PreparedFilter,
}

/// Fixed set of filter slots.
pub(crate) struct FilterPool {
    slots: Vec<FilterSlot>,
}

impl FilterPool {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count)
                .map(|_| FilterSlot {
                    generation: 0,
                    state: FilterState::Free,
                    owner: None,
                    rule: SectionFilter::default(),
                    prepared: PreparedFilter::default(),
                })
                .collect(),
        }
    }

    pub fn allocate(&mut self, owner: usize, rule: SectionFilter, state: FilterState) -> Result<SlotId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.state == FilterState::Free)
            .ok_or(DemuxError::Busy("no free filter slot"))?;

        let slot = &mut self.slots[index];
        slot.state = state;
        slot.owner = Some(owner);
        slot.rule = rule;
        slot.prepared = PreparedFilter::default();
        Ok(SlotId::new(index, slot.generation))
    }

    /// Validate a filter handle and its owner.
    pub fn get(&self, id: SlotId, owner: usize) -> Result<&FilterSlot> {
        match self.slots.get(id.index) {
            Some(slot)
                if slot.generation == id.generation
                    && slot.state != FilterState::Free
                    && slot.owner == Some(owner) =>
            {
                Ok(slot)
            }
            _ => Err(stale(id)),
        }
    }

    pub fn slot(&self, index: usize) -> &FilterSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FilterSlot {
        &mut self.slots[index]
    }

    /// Current handle of an occupied slot.
    pub fn id(&self, index: usize) -> SlotId {
        SlotId::new(index, self.slots[index].generation)
    }

    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = FilterState::Free;
        slot.owner = None;
        slot.generation = slot.generation.wrapping_add(1);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state == FilterState::Free).count()
    }
}

fn stale(id: SlotId) -> DemuxError {
    DemuxError::StaleHandle {
        index: id.index,
        generation: id.generation,
    }
}
