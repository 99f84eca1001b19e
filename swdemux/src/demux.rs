//! The demultiplexer device.
//!
//! Two locks guard the state. The admin lock serialises allocate, set,
//! start, stop and release, and owns the decoder PES table and the TS
//! compatibility bookkeeping. The packet lock guards everything the packet
//! path touches: framers, feed and filter pools, the continuity table and the
//! statistics. The admin lock is always taken first, the packet path never
//! takes it, and `start_feed`/`stop_feed` hooks run with only the admin lock
//! held.
//!
//! Callbacks run under the packet lock and must not call back into the same
//! [`Demux`].

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bbframe::{BbIsi, BbMode, BbStreamFramer, UpCursor, BB_MAX_FRAME_LEN};
use crate::config::DemuxConfig;
use crate::dispatch::DispatchCore;
use crate::error::{DemuxError, Result};
use crate::feed::{
    BbCallback, BbFeed, BbFeedHandle, BbFeedParams, BbSink, FeedData, FeedHandle, FeedState, FilterHandle,
    FilterState, SectionCallback, SectionFeed, SectionFeedHandle, SlotId, TsCallback, TsFeed, TsFeedHandle,
    TsFeedParams, TsType, PES_SLOT_COUNT,
};
use crate::filter::{PreparedFilter, SectionFilter};
use crate::framer::{FrameFormat, TsFramer};
use crate::hooks::{DemuxHooks, FeedKind};
use crate::packet::{MAX_PID, PID_WILDCARD};
use crate::stats::DemuxStats;

/// Delivery timeout of the internal TS compatibility feeds.
const TS_COMPAT_TIMEOUT: Duration = Duration::from_millis(1);

struct AdminState {
    /// Feed slot owning each decoder PES slot.
    pes_owner: [Option<usize>; PES_SLOT_COUNT],
    /// PID registered for each decoder PES slot.
    pes_pids: [Option<u16>; PES_SLOT_COUNT],
    /// Internal TS compatibility feeds.
    ts_compat: Vec<(BbIsi, BbFeedHandle)>,
}

struct FastState {
    framer: TsFramer,
    bb_framer: BbStreamFramer,
    core: DispatchCore,
}

/// Software demultiplexer.
pub struct Demux {
    hooks: Option<Arc<dyn DemuxHooks>>,
    filter_capacity: usize,
    admin: Mutex<AdminState>,
    fast: Mutex<FastState>,
}

impl Demux {
    /// Demux without collaborator hooks. Feeds can be registered but not
    /// started.
    pub fn new(config: DemuxConfig) -> Self {
        Self::build(config, None)
    }

    /// Demux driven by `hooks`.
    pub fn with_hooks(config: DemuxConfig, hooks: Arc<dyn DemuxHooks>) -> Self {
        Self::build(config, Some(hooks))
    }

    fn build(config: DemuxConfig, hooks: Option<Arc<dyn DemuxHooks>>) -> Self {
        debug!(
            "Creating demux: {} feed slots, {} filter slots, ts_check={}, speed_check={}",
            config.feed_count, config.filter_count, config.ts_check, config.speed_check
        );

        let filter_capacity = config.filter_count;
        Self {
            admin: Mutex::new(AdminState {
                pes_owner: [None; PES_SLOT_COUNT],
                pes_pids: [None; PES_SLOT_COUNT],
                ts_compat: Vec::new(),
            }),
            fast: Mutex::new(FastState {
                framer: TsFramer::new(),
                bb_framer: BbStreamFramer::new(),
                core: DispatchCore::new(config, hooks.clone()),
            }),
            hooks,
            filter_capacity,
        }
    }

    // ---- Ingestion ----

    /// Feed a chunk of a 188-byte packet stream.
    pub fn swfilter(&self, data: &[u8]) {
        self.swfilter_format(FrameFormat::Ts188, data);
    }

    /// Feed a chunk of a 204-byte packet stream (16 trailing parity bytes).
    pub fn swfilter_204(&self, data: &[u8]) {
        self.swfilter_format(FrameFormat::Ts204, data);
    }

    fn swfilter_format(&self, format: FrameFormat, data: &[u8]) {
        let mut fast = self.fast.lock();
        let FastState { framer, core, .. } = &mut *fast;
        let lost = framer.push(format, data, &mut |packet| core.dispatch_packet(packet));
        core.stats.lost_bytes += lost as u64;
    }

    /// Feed packets that are already aligned, spaced by the frame size of the
    /// last framed input.
    pub fn swfilter_packets(&self, data: &[u8]) {
        let mut fast = self.fast.lock();
        let stride = fast.framer.format().frame_size();
        fast.core.dispatch_aligned(data, stride);
    }

    /// Hand `data` verbatim to the raw capture feed (the TS feed in slot 0).
    pub fn swfilter_raw(&self, data: &[u8]) {
        self.fast.lock().core.dispatch_raw(data);
    }

    /// Process one complete base-band frame. Returns the number of bytes the
    /// frame occupies (header plus data field).
    pub fn swfilter_bbframe(&self, frame: &[u8]) -> Result<usize> {
        Ok(self.fast.lock().core.dispatch_bbframe(frame)?)
    }

    /// Feed a chunk of a continuous base-band frame stream.
    pub fn swfilter_bb_stream(&self, data: &[u8]) {
        let mut fast = self.fast.lock();
        let FastState { bb_framer, core, .. } = &mut *fast;
        let lost = bb_framer.push(data, &mut |frame| {
            // Rejections are counted by the dispatcher.
            let _ = core.dispatch_bbframe(frame);
        });
        core.stats.bb_lost_bytes += lost as u64;
    }

    // ---- TS feeds ----

    /// Allocate a TS feed. A filter slot is reserved along with it.
    pub fn allocate_ts_feed(&self, callback: TsCallback) -> Result<TsFeedHandle> {
        let data = FeedData::Ts(TsFeed::new(SlotId::new(0, 0), callback));
        let _admin = self.admin.lock();

        let (result, garbage) = {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;
            match core.feeds.allocate(data) {
                Err(data) => (Err(DemuxError::Busy("no free feed slot")), Some(data)),
                Ok(id) => match core.filters.allocate(id.index(), SectionFilter::any(), FilterState::Allocated) {
                    Ok(filter) => {
                        if let FeedData::Ts(ts) = &mut core.feeds.slot_mut(id.index()).data {
                            ts.filter = filter;
                        }
                        (Ok(TsFeedHandle(id)), None)
                    }
                    Err(e) => (Err(e), Some(core.feeds.release(id))),
                },
            }
        };
        drop(garbage);

        if let Ok(handle) = &result {
            debug!("Allocated TS feed {}", handle.index());
        }
        result
    }

    /// Select the PID and delivery mode of a TS feed.
    pub fn set_ts_feed(&self, handle: TsFeedHandle, params: TsFeedParams) -> Result<()> {
        if params.pid > PID_WILDCARD {
            return Err(DemuxError::InvalidArgument("PID out of range"));
        }
        let decoder_slot = if params.ts_type.contains(TsType::DECODER) {
            Some(
                params
                    .pes_type
                    .slot()
                    .ok_or(DemuxError::InvalidArgument("decoder feed needs a PES type"))?,
            )
        } else {
            None
        };

        let mut admin = self.admin.lock();
        let mut fast = self.fast.lock();
        let core = &mut fast.core;
        let index = handle.index();

        let slot = core.feeds.get_mut(handle.0, FeedKind::Ts)?;
        if slot.state == FeedState::Go {
            return Err(DemuxError::Busy("feed is filtering"));
        }
        if let Some(pes) = decoder_slot {
            if matches!(admin.pes_owner[pes], Some(owner) if owner != index) {
                return Err(DemuxError::InvalidArgument("PES slot is taken by another feed"));
            }
        }

        let first = slot.state == FeedState::Allocated;
        let FeedData::Ts(ts) = &mut slot.data else {
            return Err(DemuxError::InvalidArgument("not a TS feed"));
        };

        // A re-set may move the feed to another PES slot.
        if let Some(old) = decoder_pes_slot(ts) {
            if Some(old) != decoder_slot && admin.pes_owner[old] == Some(index) {
                admin.pes_owner[old] = None;
                admin.pes_pids[old] = None;
            }
        }
        if let Some(pes) = decoder_slot {
            admin.pes_owner[pes] = Some(index);
            admin.pes_pids[pes] = Some(params.pid);
        }

        ts.pid = Some(params.pid);
        ts.ts_type = params.ts_type;
        ts.pes_type = params.pes_type;
        ts.buffer_size = params.buffer_size;
        ts.timeout = params.timeout;
        slot.state = FeedState::Ready;
        if first {
            core.add_active(index);
        }

        debug!("TS feed {} set: PID 0x{:04X} {:?}", index, params.pid, params.ts_type);
        Ok(())
    }

    /// Release a TS feed, stopping it first if it is running.
    pub fn release_ts_feed(&self, handle: TsFeedHandle) -> Result<()> {
        let mut admin = self.admin.lock();
        self.stop_if_running(handle.0, FeedKind::Ts)?;

        let data = {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;
            if core.feeds.get(handle.0, FeedKind::Ts)?.state != FeedState::Allocated {
                core.remove_active(handle.index());
            }
            let data = core.feeds.release(handle.0);
            if let FeedData::Ts(ts) = &data {
                core.filters.release(ts.filter.index());
            }
            data
        };

        if let FeedData::Ts(ts) = &data {
            if let Some(pes) = decoder_pes_slot(ts) {
                if admin.pes_owner[pes] == Some(handle.index()) {
                    admin.pes_owner[pes] = None;
                    admin.pes_pids[pes] = None;
                }
            }
        }

        debug!("Released TS feed {}", handle.index());
        Ok(())
    }

    /// PIDs registered for the decoder PES slots, indexed by
    /// [`crate::PesType::slot`].
    pub fn pes_pids(&self) -> [Option<u16>; PES_SLOT_COUNT] {
        self.admin.lock().pes_pids
    }

    // ---- Section feeds ----

    pub fn allocate_section_feed(&self, callback: SectionCallback) -> Result<SectionFeedHandle> {
        let data = FeedData::Section(SectionFeed::new(self.filter_capacity, callback));
        let _admin = self.admin.lock();

        let result = self.fast.lock().core.feeds.allocate(data);
        match result {
            Ok(id) => {
                debug!("Allocated section feed {}", id.index());
                Ok(SectionFeedHandle(id))
            }
            Err(_data) => Err(DemuxError::Busy("no free feed slot")),
        }
    }

    /// Select the PID of a section feed. With `check_crc`, sections with the
    /// syntax indicator set are dropped unless their CRC-32 verifies.
    pub fn set_section_feed(
        &self,
        handle: SectionFeedHandle,
        pid: u16,
        buffer_size: usize,
        check_crc: bool,
    ) -> Result<()> {
        if pid > MAX_PID {
            return Err(DemuxError::InvalidArgument("section PID out of range"));
        }

        let _admin = self.admin.lock();
        let mut fast = self.fast.lock();
        let core = &mut fast.core;

        let slot = core.feeds.get_mut(handle.0, FeedKind::Section)?;
        if slot.state == FeedState::Go {
            return Err(DemuxError::Busy("feed is filtering"));
        }
        let first = slot.state == FeedState::Allocated;
        if let FeedData::Section(sec) = &mut slot.data {
            sec.pid = Some(pid);
            sec.buffer_size = buffer_size;
            sec.check_crc = check_crc;
        }
        slot.state = FeedState::Ready;
        if first {
            core.add_active(handle.index());
        }

        debug!("Section feed {} set: PID 0x{:04X} check_crc={}", handle.index(), pid, check_crc);
        Ok(())
    }

    /// Attach a filter rule to a section feed. The newest filter is evaluated
    /// first.
    pub fn allocate_filter(&self, handle: SectionFeedHandle, rule: SectionFilter) -> Result<FilterHandle> {
        let _admin = self.admin.lock();
        let mut fast = self.fast.lock();
        let core = &mut fast.core;
        let index = handle.index();

        let running = core.feeds.get(handle.0, FeedKind::Section)?.state == FeedState::Go;
        let id = core.filters.allocate(index, rule, FilterState::Ready)?;
        if running {
            let filter = core.filters.slot_mut(id.index());
            filter.prepared = PreparedFilter::prepare(&filter.rule);
        }
        if let FeedData::Section(sec) = &mut core.feeds.slot_mut(index).data {
            sec.filters.push(id.index());
        }

        Ok(FilterHandle(id))
    }

    /// Detach and free a filter. A running feed is stopped first.
    pub fn release_filter(&self, handle: SectionFeedHandle, filter: FilterHandle) -> Result<()> {
        let _admin = self.admin.lock();
        {
            let fast = self.fast.lock();
            fast.core.feeds.get(handle.0, FeedKind::Section)?;
            fast.core.filters.get(filter.0, handle.index())?;
        }

        self.stop_if_running(handle.0, FeedKind::Section)?;

        let mut fast = self.fast.lock();
        let core = &mut fast.core;
        if let FeedData::Section(sec) = &mut core.feeds.slot_mut(handle.index()).data {
            sec.filters.retain(|&f| f != filter.index());
        }
        core.filters.release(filter.index());
        Ok(())
    }

    /// Release a section feed together with its filters, stopping it first
    /// if it is running.
    pub fn release_section_feed(&self, handle: SectionFeedHandle) -> Result<()> {
        let _admin = self.admin.lock();
        self.stop_if_running(handle.0, FeedKind::Section)?;

        let _data = {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;
            if core.feeds.get(handle.0, FeedKind::Section)?.state != FeedState::Allocated {
                core.remove_active(handle.index());
            }
            let data = core.feeds.release(handle.0);
            if let FeedData::Section(sec) = &data {
                for &f in &sec.filters {
                    core.filters.release(f);
                }
            }
            data
        };

        debug!("Released section feed {}", handle.index());
        Ok(())
    }

    // ---- Base-band feeds ----

    pub fn allocate_bb_feed(&self, callback: BbCallback) -> Result<BbFeedHandle> {
        let data = FeedData::Bb(BbFeed::new(BbSink::Callback(callback)));
        let _admin = self.admin.lock();
        self.allocate_bb_locked(data)
    }

    /// Select the input stream and mode of a base-band feed.
    pub fn set_bb_feed(&self, handle: BbFeedHandle, params: BbFeedParams) -> Result<()> {
        validate_bb_params(&params)?;
        let buffer = vec![0u8; params.buffer_size];
        let _admin = self.admin.lock();
        self.set_bb_locked(handle, params, buffer)
    }

    /// Release a base-band feed, stopping it first if it is running.
    pub fn release_bb_feed(&self, handle: BbFeedHandle) -> Result<()> {
        let _admin = self.admin.lock();
        self.release_bb_locked(handle)
    }

    /// Enable or disable re-injection of the transport stream carried in
    /// base-band frames of `isi` into the packet dispatcher.
    pub fn set_ts_compat(&self, isi: BbIsi, enable: bool) -> Result<()> {
        let mut admin = self.admin.lock();
        let existing = admin.ts_compat.iter().position(|(i, _)| *i == isi);

        match (enable, existing) {
            (true, None) => {
                let params = BbFeedParams {
                    isi,
                    mode: BbMode::Transport,
                    buffer_size: BB_MAX_FRAME_LEN,
                    timeout: Some(TS_COMPAT_TIMEOUT),
                };
                validate_bb_params(&params)?;

                let handle = self.allocate_bb_locked(FeedData::Bb(BbFeed::new(BbSink::TsCompat)))?;
                let started = self
                    .set_bb_locked(handle, params, vec![0u8; BB_MAX_FRAME_LEN])
                    .and_then(|()| self.start_locked(handle.0, FeedKind::BaseBand));
                if let Err(e) = started {
                    warn!("Could not enable TS compatibility mode on {:?}: {}", isi, e);
                    self.release_bb_locked(handle)?;
                    return Err(e);
                }

                admin.ts_compat.push((isi, handle));
                info!("Enabled TS compatibility mode on {:?}", isi);
            }
            (false, Some(pos)) => {
                let (_, handle) = admin.ts_compat.remove(pos);
                self.release_bb_locked(handle)?;
                info!("Disabled TS compatibility mode on {:?}", isi);
            }
            _ => {}
        }

        Ok(())
    }

    fn allocate_bb_locked(&self, data: FeedData) -> Result<BbFeedHandle> {
        let result = self.fast.lock().core.feeds.allocate(data);
        match result {
            Ok(id) => {
                debug!("Allocated base-band feed {}", id.index());
                Ok(BbFeedHandle(id))
            }
            Err(_data) => Err(DemuxError::Busy("no free feed slot")),
        }
    }

    fn set_bb_locked(&self, handle: BbFeedHandle, params: BbFeedParams, buffer: Vec<u8>) -> Result<()> {
        let _old_buffer = {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;

            let slot = core.feeds.get_mut(handle.0, FeedKind::BaseBand)?;
            if slot.state == FeedState::Go {
                return Err(DemuxError::Busy("feed is filtering"));
            }
            let first = slot.state == FeedState::Allocated;
            let FeedData::Bb(bb) = &mut slot.data else {
                return Err(DemuxError::InvalidArgument("not a base-band feed"));
            };

            bb.isi = Some(params.isi);
            bb.mode = params.mode;
            bb.timeout = params.timeout;
            bb.cursor = UpCursor::default();
            let old = mem::replace(&mut bb.buffer, buffer);
            slot.state = FeedState::Ready;
            if first {
                core.add_active(handle.index());
            }
            old
        };

        debug!("Base-band feed {} set: {:?} {:?}", handle.index(), params.isi, params.mode);
        Ok(())
    }

    fn release_bb_locked(&self, handle: BbFeedHandle) -> Result<()> {
        self.stop_if_running(handle.0, FeedKind::BaseBand)?;

        let _data = {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;
            if core.feeds.get(handle.0, FeedKind::BaseBand)?.state != FeedState::Allocated {
                core.remove_active(handle.index());
            }
            core.feeds.release(handle.0)
        };

        debug!("Released base-band feed {}", handle.index());
        Ok(())
    }

    // ---- Lifecycle ----

    /// Start delivery to a feed that has been set.
    pub fn start_filtering<H: FeedHandle>(&self, handle: H) -> Result<()> {
        let _admin = self.admin.lock();
        self.start_locked(handle.slot(), H::KIND)
    }

    /// Stop delivery. The feed returns to the ready state even when the
    /// `stop_feed` hook fails; the hook's error is returned afterwards.
    pub fn stop_filtering<H: FeedHandle>(&self, handle: H) -> Result<()> {
        let _admin = self.admin.lock();
        self.stop_locked(handle.slot(), H::KIND)
    }

    /// Lifecycle state of a feed.
    pub fn feed_state<H: FeedHandle>(&self, handle: H) -> Result<FeedState> {
        Ok(self.fast.lock().core.feeds.get(handle.slot(), H::KIND)?.state)
    }

    fn start_locked(&self, id: SlotId, kind: FeedKind) -> Result<()> {
        let info = {
            let fast = self.fast.lock();
            let slot = fast.core.feeds.get(id, kind)?;
            match (&slot.data, slot.state) {
                (FeedData::Section(_), FeedState::Go) => {
                    return Err(DemuxError::Busy("section feed is already filtering"))
                }
                (FeedData::Section(sec), FeedState::Ready) if sec.filters.is_empty() => {
                    return Err(DemuxError::InvalidArgument("section feed has no filter"))
                }
                (_, FeedState::Ready) => {}
                _ => return Err(DemuxError::InvalidArgument("feed is not ready")),
            }
            slot.info(id.index())
        };

        let hooks = self.hooks.as_ref().ok_or(DemuxError::NoDevice("no start_feed hook"))?;

        if kind == FeedKind::Section {
            let mut fast = self.fast.lock();
            let core = &mut fast.core;
            if let FeedData::Section(sec) = &mut core.feeds.slot_mut(id.index()).data {
                sec.reassembler.reset();
                for &f in &sec.filters {
                    let filter = core.filters.slot_mut(f);
                    filter.prepared = PreparedFilter::prepare(&filter.rule);
                }
            }
        }

        if let Err(e) = hooks.start_feed(&info) {
            warn!("start_feed hook failed for feed {}: {}", id.index(), e);
            return Err(e);
        }

        self.fast.lock().core.feeds.get_mut(id, kind)?.state = FeedState::Go;
        debug!("Feed {} ({:?}) started", id.index(), kind);
        Ok(())
    }

    fn stop_locked(&self, id: SlotId, kind: FeedKind) -> Result<()> {
        let info = {
            let fast = self.fast.lock();
            let slot = fast.core.feeds.get(id, kind)?;
            if slot.state != FeedState::Go {
                return Err(DemuxError::InvalidArgument("feed is not filtering"));
            }
            slot.info(id.index())
        };

        let hooks = self.hooks.as_ref().ok_or(DemuxError::NoDevice("no stop_feed hook"))?;
        let result = hooks.stop_feed(&info);

        self.fast.lock().core.feeds.get_mut(id, kind)?.state = FeedState::Ready;

        match &result {
            Ok(()) => debug!("Feed {} ({:?}) stopped", id.index(), kind),
            Err(e) => warn!("stop_feed hook failed for feed {}: {}", id.index(), e),
        }
        result
    }

    fn stop_if_running(&self, id: SlotId, kind: FeedKind) -> Result<()> {
        let running = self.fast.lock().core.feeds.get(id, kind)?.state == FeedState::Go;
        if running {
            if let Err(e) = self.stop_locked(id, kind) {
                warn!("Stopping feed {} before release: {}", id.index(), e);
            }
        }
        Ok(())
    }

    // ---- Statistics ----

    /// Snapshot of the packet-path counters.
    pub fn stats(&self) -> DemuxStats {
        self.fast.lock().core.stats.clone()
    }
}

fn validate_bb_params(params: &BbFeedParams) -> Result<()> {
    if params.isi == BbIsi::All && params.mode != BbMode::Frame {
        return Err(DemuxError::InvalidArgument("all input streams is only valid for frame feeds"));
    }
    if params.mode.is_packetized() && params.buffer_size == 0 {
        return Err(DemuxError::InvalidArgument("packetized base-band feeds need a buffer"));
    }
    Ok(())
}

/// PES slot claimed by a decoder feed.
fn decoder_pes_slot(ts: &TsFeed) -> Option<usize> {
    if ts.ts_type.contains(TsType::DECODER) {
        ts.pes_type.slot()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbframe::tests::{make_frame, mode_adapt, slice_into_frames, user_packet};
    use crate::feed::{DmxStatus, PesType};
    use crate::framer::tests::packet_stream;
    use crate::hooks::{FeedInfo, SoftwareHooks};
    use crate::section::tests::{make_section, ts_packet};

    type Log = Arc<Mutex<Vec<(usize, Vec<u8>)>>>;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        fail_start: Mutex<bool>,
        fail_stop: Mutex<bool>,
        decoded: Mutex<Vec<(u16, usize)>>,
    }

    impl DemuxHooks for RecordingHooks {
        fn start_feed(&self, feed: &FeedInfo) -> Result<()> {
            self.calls.lock().push(format!("start {}", feed.index));
            if *self.fail_start.lock() {
                return Err(DemuxError::Hook("start refused".into()));
            }
            Ok(())
        }

        fn stop_feed(&self, feed: &FeedInfo) -> Result<()> {
            self.calls.lock().push(format!("stop {}", feed.index));
            if *self.fail_stop.lock() {
                return Err(DemuxError::Hook("stop refused".into()));
            }
            Ok(())
        }

        fn write_to_decoder(&self, feed: &FeedInfo, packet: &[u8]) {
            self.decoded.lock().push((feed.pid.unwrap_or_default(), packet.len()));
        }
    }

    fn config(feeds: usize, filters: usize) -> DemuxConfig {
        DemuxConfig {
            feed_count: feeds,
            filter_count: filters,
            ..Default::default()
        }
    }

    fn software_demux() -> Demux {
        Demux::with_hooks(DemuxConfig::default(), Arc::new(SoftwareHooks))
    }

    fn ts_callback(log: &Log) -> TsCallback {
        let sink = log.clone();
        Box::new(move |data: &[u8], handle: TsFeedHandle, _: DmxStatus| {
            sink.lock().push((handle.index(), data.to_vec()))
        })
    }

    fn section_callback(log: &Log) -> SectionCallback {
        let sink = log.clone();
        Box::new(move |data: &[u8], handle: FilterHandle, _: DmxStatus| {
            sink.lock().push((handle.index(), data.to_vec()))
        })
    }

    fn bb_callback(log: &Log) -> BbCallback {
        let sink = log.clone();
        Box::new(move |data: &[u8], upl: usize, _: BbFeedHandle, _: DmxStatus| {
            sink.lock().push((upl, data.to_vec()))
        })
    }

    fn running_ts_feed(demux: &Demux, pid: u16, log: &Log) -> TsFeedHandle {
        let feed = demux.allocate_ts_feed(ts_callback(log)).unwrap();
        demux.set_ts_feed(feed, TsFeedParams::new(pid, TsType::PACKET)).unwrap();
        demux.start_filtering(feed).unwrap();
        feed
    }

    #[test]
    fn test_ts_feed_lifecycle() {
        let hooks = Arc::new(RecordingHooks::default());
        let demux = Demux::with_hooks(DemuxConfig::default(), hooks.clone());
        let log: Log = Default::default();

        let feed = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Allocated);
        // Not set yet.
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::InvalidArgument("feed is not ready"))
        );

        demux.set_ts_feed(feed, TsFeedParams::new(0x100, TsType::PACKET)).unwrap();
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);
        demux.start_filtering(feed).unwrap();
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Go);
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::InvalidArgument("feed is not ready"))
        );

        let stream = packet_stream(4, 188);
        demux.swfilter(&stream[..300]);
        demux.swfilter(&stream[300..]);
        assert_eq!(log.lock().len(), 4);

        demux.stop_filtering(feed).unwrap();
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);
        demux.swfilter(&stream);
        assert_eq!(log.lock().len(), 4);
        assert_eq!(
            demux.stop_filtering(feed),
            Err(DemuxError::InvalidArgument("feed is not filtering"))
        );

        demux.release_ts_feed(feed).unwrap();
        assert!(matches!(demux.feed_state(feed), Err(DemuxError::StaleHandle { .. })));
        assert!(matches!(demux.release_ts_feed(feed), Err(DemuxError::StaleHandle { .. })));
        assert_eq!(hooks.calls.lock().as_slice(), &["start 0".to_string(), "stop 0".to_string()]);
        assert_eq!(demux.stats().packets, 8);
    }

    #[test]
    fn test_release_running_feed_stops_it() {
        let hooks = Arc::new(RecordingHooks::default());
        let demux = Demux::with_hooks(DemuxConfig::default(), hooks.clone());
        let log: Log = Default::default();

        let feed = running_ts_feed(&demux, 0x100, &log);
        demux.release_ts_feed(feed).unwrap();
        assert_eq!(hooks.calls.lock().as_slice(), &["start 0".to_string(), "stop 0".to_string()]);

        demux.swfilter(&packet_stream(2, 188));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_slot_reuse_rejects_old_handle() {
        let demux = Demux::with_hooks(config(1, 4), Arc::new(SoftwareHooks));
        let log: Log = Default::default();

        let old = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        demux.release_ts_feed(old).unwrap();
        let new = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());

        assert!(matches!(
            demux.set_ts_feed(old, TsFeedParams::new(0x100, TsType::PACKET)),
            Err(DemuxError::StaleHandle { .. })
        ));
        demux.set_ts_feed(new, TsFeedParams::new(0x100, TsType::PACKET)).unwrap();
    }

    #[test]
    fn test_allocation_exhaustion() {
        let demux = Demux::with_hooks(config(2, 1), Arc::new(SoftwareHooks));
        let log: Log = Default::default();

        // The TS feed takes the only filter slot.
        let ts = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        assert_eq!(
            demux.allocate_ts_feed(ts_callback(&log)).unwrap_err(),
            DemuxError::Busy("no free filter slot")
        );

        // The failed allocation gave its feed slot back.
        let sec = demux.allocate_section_feed(section_callback(&log)).unwrap();
        assert_eq!(
            demux.allocate_section_feed(section_callback(&log)).unwrap_err(),
            DemuxError::Busy("no free feed slot")
        );
        assert_eq!(
            demux.allocate_filter(sec, SectionFilter::any()).unwrap_err(),
            DemuxError::Busy("no free filter slot")
        );

        demux.release_ts_feed(ts).unwrap();
        demux.allocate_filter(sec, SectionFilter::any()).unwrap();
    }

    #[test]
    fn test_without_hooks_start_fails() {
        let demux = Demux::new(DemuxConfig::default());
        let log: Log = Default::default();
        let feed = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        demux.set_ts_feed(feed, TsFeedParams::new(0x100, TsType::PACKET)).unwrap();
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::NoDevice("no start_feed hook"))
        );
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);
    }

    #[test]
    fn test_start_hook_failure_aborts() {
        let hooks = Arc::new(RecordingHooks::default());
        *hooks.fail_start.lock() = true;
        let demux = Demux::with_hooks(DemuxConfig::default(), hooks.clone());
        let log: Log = Default::default();

        let feed = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        demux.set_ts_feed(feed, TsFeedParams::new(0x100, TsType::PACKET)).unwrap();
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::Hook("start refused".into()))
        );
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);

        demux.swfilter(&packet_stream(2, 188));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_stop_hook_failure_still_stops() {
        let hooks = Arc::new(RecordingHooks::default());
        let demux = Demux::with_hooks(DemuxConfig::default(), hooks.clone());
        let log: Log = Default::default();

        let feed = running_ts_feed(&demux, 0x100, &log);
        *hooks.fail_stop.lock() = true;
        assert_eq!(
            demux.stop_filtering(feed),
            Err(DemuxError::Hook("stop refused".into()))
        );
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);

        demux.swfilter(&packet_stream(2, 188));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_set_validation() {
        let demux = software_demux();
        let log: Log = Default::default();

        let ts = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        assert!(matches!(
            demux.set_ts_feed(ts, TsFeedParams::new(0x2001, TsType::PACKET)),
            Err(DemuxError::InvalidArgument(_))
        ));
        // Decoder feeds need a real PES type.
        assert!(matches!(
            demux.set_ts_feed(ts, TsFeedParams::new(0x100, TsType::DECODER)),
            Err(DemuxError::InvalidArgument(_))
        ));
        demux.set_ts_feed(ts, TsFeedParams::new(PID_WILDCARD, TsType::PACKET)).unwrap();
        demux.start_filtering(ts).unwrap();
        assert_eq!(
            demux.set_ts_feed(ts, TsFeedParams::new(0x100, TsType::PACKET)),
            Err(DemuxError::Busy("feed is filtering"))
        );

        let sec = demux.allocate_section_feed(section_callback(&log)).unwrap();
        assert!(matches!(
            demux.set_section_feed(sec, PID_WILDCARD, 4096, true),
            Err(DemuxError::InvalidArgument(_))
        ));

        let bb = demux.allocate_bb_feed(bb_callback(&log)).unwrap();
        assert!(matches!(
            demux.set_bb_feed(bb, BbFeedParams::new(BbIsi::All, BbMode::Transport, 7274)),
            Err(DemuxError::InvalidArgument(_))
        ));
        assert!(matches!(
            demux.set_bb_feed(bb, BbFeedParams::new(BbIsi::Sis, BbMode::PacketizedGs, 0)),
            Err(DemuxError::InvalidArgument(_))
        ));
        demux.set_bb_feed(bb, BbFeedParams::new(BbIsi::All, BbMode::Frame, 0)).unwrap();

        // Handles of one kind are not accepted as another.
        let as_section = SectionFeedHandle(SlotId::new(bb.index(), bb.generation()));
        assert!(matches!(
            demux.start_filtering(as_section),
            Err(DemuxError::StaleHandle { .. })
        ));
    }

    #[test]
    fn test_decoder_feeds_and_pes_table() {
        let hooks = Arc::new(RecordingHooks::default());
        let demux = Demux::with_hooks(DemuxConfig::default(), hooks.clone());
        let log: Log = Default::default();

        let video = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        let params = TsFeedParams {
            pes_type: PesType::Video0,
            ..TsFeedParams::new(0x111, TsType::DECODER)
        };
        demux.set_ts_feed(video, params).unwrap();
        assert_eq!(demux.pes_pids()[PesType::Video0.slot().unwrap()], Some(0x111));

        // The slot belongs to the first feed.
        let other = demux.allocate_ts_feed(ts_callback(&log)).unwrap();
        assert_eq!(
            demux.set_ts_feed(other, TsFeedParams { pid: 0x112, ..params }),
            Err(DemuxError::InvalidArgument("PES slot is taken by another feed"))
        );
        // Re-setting the owner is fine.
        demux.set_ts_feed(video, TsFeedParams { pid: 0x110, ..params }).unwrap();
        assert_eq!(demux.pes_pids()[1], Some(0x110));

        demux.start_filtering(video).unwrap();
        let packet = ts_packet(0x110, false, 0, &[0u8; 184]);
        demux.swfilter(&packet);
        assert_eq!(hooks.decoded.lock().as_slice(), &[(0x110, 188)]);
        // Decoder-only feeds do not call the packet callback.
        assert!(log.lock().is_empty());

        demux.release_ts_feed(video).unwrap();
        assert_eq!(demux.pes_pids()[1], None);
        demux.set_ts_feed(other, TsFeedParams { pid: 0x112, ..params }).unwrap();
    }

    #[test]
    fn test_section_feed_end_to_end() {
        let hooks = Arc::new(RecordingHooks::default());
        let demux = Demux::with_hooks(config(8, 4), hooks.clone());
        let log: Log = Default::default();

        let feed = demux.allocate_section_feed(section_callback(&log)).unwrap();
        demux.set_section_feed(feed, 0x12, 4096, true).unwrap();
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::InvalidArgument("section feed has no filter"))
        );

        let eit = demux.allocate_filter(feed, SectionFilter::table_id(0x4E)).unwrap();
        demux.start_filtering(feed).unwrap();
        assert_eq!(
            demux.start_filtering(feed),
            Err(DemuxError::Busy("section feed is already filtering"))
        );

        // One long section over three packets, then a corrupted copy.
        let section = make_section(0x4E, 400);
        let mut corrupted = section.clone();
        corrupted[100] ^= 0x01;
        let mut stream = Vec::new();
        let mut cc = 0u8;
        for s in [&section, &corrupted] {
            let mut first = vec![0u8];
            first.extend_from_slice(&s[..183]);
            stream.extend_from_slice(&ts_packet(0x12, true, cc, &first));
            cc += 1;
            for chunk in s[183..].chunks(184) {
                stream.extend_from_slice(&ts_packet(0x12, false, cc, chunk));
                cc += 1;
            }
        }
        for chunk in stream.chunks(100) {
            demux.swfilter(chunk);
        }

        assert_eq!(log.lock().as_slice(), &[(eit.index(), section.clone())]);
        let stats = demux.stats();
        assert_eq!(stats.section_crc_errors, 1);

        // A filter added to a running feed takes effect immediately.
        let any = demux.allocate_filter(feed, SectionFilter::any()).unwrap();
        let short = make_section(0x42, 10);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&short);
        demux.swfilter(&ts_packet(0x12, true, cc, &payload));
        assert_eq!(log.lock().last(), Some(&(any.index(), short.clone())));

        // Releasing a filter of a running feed stops the feed.
        demux.release_filter(feed, any).unwrap();
        assert_eq!(demux.feed_state(feed).unwrap(), FeedState::Ready);
        assert!(matches!(demux.release_filter(feed, any), Err(DemuxError::StaleHandle { .. })));

        // Releasing the feed frees the remaining filter.
        demux.release_section_feed(feed).unwrap();
        let feed = demux.allocate_section_feed(section_callback(&log)).unwrap();
        for _ in 0..4 {
            demux.allocate_filter(feed, SectionFilter::any()).unwrap();
        }
        assert_eq!(
            hooks.calls.lock().as_slice(),
            &["start 0".to_string(), "stop 0".to_string()]
        );
    }

    #[test]
    fn test_restart_drops_partial_section() {
        let demux = software_demux();
        let log: Log = Default::default();
        let feed = demux.allocate_section_feed(section_callback(&log)).unwrap();
        demux.set_section_feed(feed, 0x12, 4096, false).unwrap();
        demux.allocate_filter(feed, SectionFilter::any()).unwrap();
        demux.start_filtering(feed).unwrap();

        let section = make_section(0x42, 300);
        let mut first = vec![0u8];
        first.extend_from_slice(&section[..183]);
        demux.swfilter(&ts_packet(0x12, true, 0, &first));
        demux.stop_filtering(feed).unwrap();
        demux.start_filtering(feed).unwrap();
        demux.swfilter(&ts_packet(0x12, false, 1, &section[183..]));

        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_framing_formats_and_aligned_input() {
        let demux = software_demux();
        let log: Log = Default::default();
        running_ts_feed(&demux, 0x100, &log);

        demux.swfilter_204(&packet_stream(2, 204));
        assert_eq!(log.lock().len(), 2);
        // Pre-aligned input now uses the 204-byte stride.
        demux.swfilter_packets(&packet_stream(3, 204));
        assert_eq!(log.lock().len(), 5);
        assert!(log.lock().iter().all(|(_, p)| p.len() == 188));

        // Garbage in front of a 188 stream is skipped and counted.
        let mut input = vec![0u8; 7];
        input.extend_from_slice(&packet_stream(1, 188));
        demux.swfilter(&input);
        assert_eq!(log.lock().len(), 6);
        assert_eq!(demux.stats().lost_bytes, 7);
    }

    #[test]
    fn test_swfilter_raw() {
        let demux = software_demux();
        let log: Log = Default::default();
        running_ts_feed(&demux, PID_WILDCARD, &log);
        demux.swfilter_raw(&[1, 2, 3, 4]);
        assert_eq!(log.lock().as_slice(), &[(0, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_bb_stream_with_corrupt_header() {
        let demux = software_demux();
        let log: Log = Default::default();
        let feed = demux.allocate_bb_feed(bb_callback(&log)).unwrap();
        demux.set_bb_feed(feed, BbFeedParams::new(BbIsi::Stream(3), BbMode::ContinuousGs, 0)).unwrap();
        demux.start_filtering(feed).unwrap();

        let good1 = make_frame(0x40, 3, 0, 0, None, &[1; 50]);
        let mut bad = make_frame(0x40, 3, 0, 0, None, &[2; 50]);
        bad[9] ^= 0x80;
        let good2 = make_frame(0x40, 3, 0, 0, None, &[3; 50]);
        let other_isi = make_frame(0x40, 4, 0, 0, None, &[4; 50]);

        let mut stream = Vec::new();
        for f in [&good1, &bad, &good2, &other_isi] {
            stream.extend_from_slice(f);
        }
        for chunk in stream.chunks(37) {
            demux.swfilter_bb_stream(chunk);
        }

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], (0, vec![1; 50]));
        assert_eq!(log[1], (0, vec![3; 50]));
        let stats = demux.stats();
        assert_eq!(stats.bb_frames, 3);
        assert!(stats.bb_lost_bytes > 0);
    }

    #[test]
    fn test_swfilter_bbframe_errors() {
        let demux = software_demux();
        assert_eq!(
            demux.swfilter_bbframe(&[0u8; 4]),
            Err(DemuxError::BbFrame(crate::bbframe::BbFrameError::Length(4)))
        );
        let frame = make_frame(0x60, 0, 0, 0, None, &[7; 20]);
        assert_eq!(demux.swfilter_bbframe(&frame), Ok(30));
    }

    #[test]
    fn test_ts_compat_mode() {
        let demux = software_demux();
        let log: Log = Default::default();
        running_ts_feed(&demux, 0x100, &log);

        assert!(matches!(
            demux.set_ts_compat(BbIsi::All, true),
            Err(DemuxError::InvalidArgument(_))
        ));
        demux.set_ts_compat(BbIsi::Sis, true).unwrap();
        // Enabling twice is a no-op.
        demux.set_ts_compat(BbIsi::Sis, true).unwrap();

        let packets: Vec<Vec<u8>> = (0..45).map(user_packet).collect();
        let (stream, starts) = mode_adapt(&packets);
        let frames = slice_into_frames(&stream, &starts, 2000);
        for (syncd, df) in &frames {
            let frame = make_frame(0xF0, 0, 188, 0x47, *syncd, df);
            demux.swfilter_bbframe(&frame).unwrap();
        }

        // 38 packets fill the feed buffer and are handed over at once.
        assert_eq!(log.lock().len(), 38);
        assert_eq!(log.lock()[5].1, packets[5]);

        demux.set_ts_compat(BbIsi::Sis, false).unwrap();
        demux.set_ts_compat(BbIsi::Sis, false).unwrap();
        for (syncd, df) in &frames {
            let frame = make_frame(0xF0, 0, 188, 0x47, *syncd, df);
            demux.swfilter_bbframe(&frame).unwrap();
        }
        assert_eq!(log.lock().len(), 38);
    }
}
