//! Packet dispatcher.
//!
//! Everything in here runs under the packet lock. Per packet: the optional
//! speed meter, the TEI policy, the optional continuity check, then fan-out
//! over the active feeds in registration order.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info};

use crate::bbframe::{
    reassemble_user_packets, BbFrameError, BbHeader, BbIsi, BbMode, StreamType, UpCursor, UpReport,
    BB_HEADER_LEN, BB_MAX_FRAME_LEN, BB_TS_USER_PACKET_LEN,
};
use crate::config::DemuxConfig;
use crate::crc::crc32_mpeg2;
use crate::error::Result;
use crate::feed::{
    BbFeedHandle, BbSink, DmxStatus, FeedData, FeedPool, FeedState, FilterHandle, FilterPool, SectionFeed,
    SlotId, TsFeed, TsFeedHandle, TsType,
};
use crate::hooks::DemuxHooks;
use crate::packet::{
    continuity_counter, has_payload, pid, transport_error, MAX_PID, PID_WILDCARD, SYNC_BYTE, TS_PACKET_SIZE,
};
use crate::section::extract_payload;
use crate::stats::DemuxStats;

/// Continuity table entry for a PID not seen yet.
const CC_UNKNOWN: u8 = 0xFF;

/// Repeated packet-path diagnostics are logged once per this many events.
const LOG_EVERY: u64 = 1000;

/// Counts an event and tells when it is worth logging.
#[derive(Debug, Default)]
struct Occurrences(u64);

impl Occurrences {
    fn bump(&mut self) -> Option<u64> {
        self.0 += 1;
        (self.0 % LOG_EVERY == 1).then_some(self.0)
    }
}

/// Input rate over the last `speed_interval` packets.
#[derive(Debug, Default)]
struct SpeedMeter {
    packets: u64,
    last: Option<Instant>,
}

impl SpeedMeter {
    /// Count one packet. Every `interval` packets returns the rate in kbit/s
    /// (1024-bit basis) since the previous sample, if there was one.
    fn tick(&mut self, interval: u64) -> Option<u64> {
        self.packets += 1;
        if interval == 0 || self.packets < interval {
            return None;
        }

        let now = Instant::now();
        let rate = self.last.and_then(|last| {
            let ms = now.duration_since(last).as_millis() as u64;
            if ms == 0 {
                return None;
            }
            let bits = self.packets * TS_PACKET_SIZE as u64 * 8;
            Some(1000 * (bits / 1024) / ms)
        });

        self.last = Some(now);
        self.packets = 0;
        rate
    }
}

/// Feed registry plus everything the packet path touches.
pub(crate) struct DispatchCore {
    config: DemuxConfig,
    pub feeds: FeedPool,
    pub filters: FilterPool,
    /// Feed slot indices receiving data, in registration order.
    active: Vec<usize>,
    cc_table: Box<[u8]>,
    speed: SpeedMeter,
    pub stats: DemuxStats,
    hooks: Option<Arc<dyn DemuxHooks>>,
    tei_log: Occurrences,
    cc_log: Occurrences,
    bb_log: Occurrences,
}

impl DispatchCore {
    pub fn new(config: DemuxConfig, hooks: Option<Arc<dyn DemuxHooks>>) -> Self {
        Self {
            feeds: FeedPool::new(config.feed_count),
            filters: FilterPool::new(config.filter_count),
            active: Vec::with_capacity(config.feed_count),
            cc_table: vec![CC_UNKNOWN; MAX_PID as usize + 1].into_boxed_slice(),
            speed: SpeedMeter::default(),
            stats: DemuxStats::default(),
            hooks,
            tei_log: Occurrences::default(),
            cc_log: Occurrences::default(),
            bb_log: Occurrences::default(),
            config,
        }
    }

    /// Append a feed to the active list.
    pub fn add_active(&mut self, index: usize) {
        if self.active.contains(&index) {
            error!("feed {} is already in the active list", index);
            return;
        }
        self.active.push(index);
    }

    /// Remove a feed from the active list, keeping the order of the rest.
    pub fn remove_active(&mut self, index: usize) {
        match self.active.iter().position(|&i| i == index) {
            Some(pos) => {
                self.active.remove(pos);
            }
            None => error!("feed {} is not in the active list", index),
        }
    }

    #[cfg(test)]
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    /// Dispatch one 188-byte packet starting with the sync byte.
    pub fn dispatch_packet(&mut self, packet: &[u8]) {
        self.stats.packets += 1;

        if self.config.speed_check {
            if let Some(kbps) = self.speed.tick(self.config.speed_interval) {
                info!("TS speed {} kbit/s", kbps);
                self.stats.speed_kbps = Some(kbps);
            }
        }

        let pid = pid(packet);
        if transport_error(packet) {
            self.stats.tei_packets += 1;
            if let Some(n) = self.tei_log.bump() {
                debug!("TEI detected, PID=0x{:04X} ({} times total)", pid, n);
            }
            if !self.config.feed_error_packets {
                return;
            }
        } else if self.config.ts_check && pid < MAX_PID {
            // The PID of a TEI packet cannot be trusted, so only clean packets
            // advance the table.
            self.check_continuity(pid, packet);
        }

        let Self {
            feeds,
            filters,
            active,
            stats,
            hooks,
            ..
        } = self;
        let hooks = hooks.as_deref();
        let mut capture_done = false;

        for &index in active.iter() {
            let slot = feeds.slot_mut(index);
            if slot.state != FeedState::Go {
                continue;
            }
            let generation = slot.generation;

            match &mut slot.data {
                FeedData::Ts(ts) => {
                    let Some(feed_pid) = ts.pid else { continue };
                    if feed_pid != pid && feed_pid != PID_WILDCARD {
                        continue;
                    }
                    if ts.is_capture() {
                        if capture_done {
                            continue;
                        }
                        capture_done = true;
                    }

                    let handle = TsFeedHandle(SlotId::new(index, generation));
                    if feed_pid == pid {
                        ts_packet(ts, index, handle, packet, hooks);
                    } else {
                        (ts.callback)(packet, handle, DmxStatus::Ok);
                    }
                }
                FeedData::Section(sec) if sec.pid == Some(pid) => {
                    section_packet(sec, index, packet, filters, stats, hooks);
                }
                _ => {}
            }
        }
    }

    fn check_continuity(&mut self, pid: u16, packet: &[u8]) {
        let cc = continuity_counter(packet);
        let entry = &mut self.cc_table[pid as usize];

        if *entry == CC_UNKNOWN {
            *entry = cc;
            return;
        }

        let expected = if has_payload(packet) { (*entry + 1) & 0x0F } else { *entry };
        *entry = cc;
        if cc != expected {
            self.stats.cc_errors += 1;
            if let Some(n) = self.cc_log.bump() {
                debug!(
                    "TS packet counter mismatch, PID=0x{:04X} expected 0x{:X} got 0x{:X} ({} times total)",
                    pid, expected, cc, n
                );
            }
        }
    }

    /// Dispatch pre-aligned packets spaced `stride` bytes apart.
    pub fn dispatch_aligned(&mut self, data: &[u8], stride: usize) {
        let mut frames = data.chunks_exact(stride);
        for frame in &mut frames {
            if frame[0] == SYNC_BYTE {
                self.dispatch_packet(&frame[..TS_PACKET_SIZE]);
            } else {
                self.stats.bad_sync_packets += 1;
            }
        }
        self.stats.lost_bytes += frames.remainder().len() as u64;
    }

    /// Hand `data` unchanged to the TS feed in slot 0, if it is running.
    pub fn dispatch_raw(&mut self, data: &[u8]) {
        if self.feeds.len() == 0 {
            return;
        }

        let slot = self.feeds.slot_mut(0);
        if slot.state != FeedState::Go {
            return;
        }
        let handle = TsFeedHandle(SlotId::new(0, slot.generation));
        if let FeedData::Ts(ts) = &mut slot.data {
            (ts.callback)(data, handle, DmxStatus::Ok);
        }
    }

    /// Process one base-band frame. Returns the number of bytes consumed
    /// (header plus data field).
    pub fn dispatch_bbframe(&mut self, frame: &[u8]) -> std::result::Result<usize, BbFrameError> {
        match self.process_bbframe(frame) {
            Ok(len) => {
                self.stats.bb_frames += 1;
                Ok(len)
            }
            Err(e) => {
                self.stats.bb_frame_errors += 1;
                if let Some(n) = self.bb_log.bump() {
                    debug!("base-band frame rejected: {} ({} times total)", e, n);
                }
                Err(e)
            }
        }
    }

    fn process_bbframe(&mut self, frame: &[u8]) -> std::result::Result<usize, BbFrameError> {
        if frame.len() < BB_HEADER_LEN || frame.len() > BB_MAX_FRAME_LEN {
            return Err(BbFrameError::Length(frame.len()));
        }

        let header = BbHeader::parse(frame)?;
        let dfl = header.data_field_len();
        let available = frame.len() - BB_HEADER_LEN;
        if dfl == 0 || dfl > available {
            return Err(BbFrameError::DataField { dfl, available });
        }

        let frame = &frame[..header.frame_len()];
        let df = &frame[BB_HEADER_LEN..];
        let isi = header.isi();

        // Frame feeds see every accepted frame, whatever its stream type.
        self.deliver_bb(isi, BbMode::Frame, frame);

        match header.stream_type() {
            StreamType::Transport | StreamType::PacketizedGs => {
                let transport = header.stream_type() == StreamType::Transport;
                let upl = match header.user_packet_len() {
                    0 if transport => BB_TS_USER_PACKET_LEN,
                    0 => return Err(BbFrameError::ZeroUserPacketLength),
                    upl => upl,
                };
                let mode = if transport { BbMode::Transport } else { BbMode::PacketizedGs };
                self.reassemble_bb(isi, mode, df, upl, header.sync_distance(), header.sync);
            }
            StreamType::ContinuousGs => self.deliver_bb(isi, BbMode::ContinuousGs, df),
            StreamType::Reserved => return Err(BbFrameError::ReservedMode),
        }

        Ok(frame.len())
    }

    /// Pass `data` unchanged to the running callback feeds of `mode` that
    /// select `isi`.
    fn deliver_bb(&mut self, isi: BbIsi, mode: BbMode, data: &[u8]) {
        let Self { feeds, active, .. } = self;

        for &index in active.iter() {
            let slot = feeds.slot_mut(index);
            if slot.state != FeedState::Go {
                continue;
            }
            let handle = BbFeedHandle(SlotId::new(index, slot.generation));
            let FeedData::Bb(bb) = &mut slot.data else { continue };
            if bb.mode != mode || !matches!(bb.isi, Some(sel) if sel.selects(isi)) {
                continue;
            }
            if let BbSink::Callback(callback) = &mut bb.sink {
                callback(data, 0, handle, DmxStatus::Ok);
            }
        }
    }

    fn reassemble_bb(&mut self, isi: BbIsi, mode: BbMode, df: &[u8], upl: usize, syncd: Option<usize>, sync: u8) {
        for i in 0..self.active.len() {
            let index = self.active[i];
            let slot = self.feeds.slot_mut(index);
            if slot.state != FeedState::Go {
                continue;
            }
            let handle = BbFeedHandle(SlotId::new(index, slot.generation));
            let FeedData::Bb(bb) = &mut slot.data else { continue };
            if bb.mode != mode || !matches!(bb.isi, Some(sel) if sel.selects(isi)) {
                continue;
            }

            let result = match &mut bb.sink {
                BbSink::Callback(callback) => reassemble_user_packets(
                    &mut bb.cursor,
                    &mut bb.buffer,
                    df,
                    upl,
                    syncd,
                    sync,
                    &mut |buf, stored| callback(buf, stored, handle, DmxStatus::Ok),
                ),
                BbSink::TsCompat => {
                    let buffer = mem::take(&mut bb.buffer);
                    let cursor = bb.cursor;
                    self.reassemble_ts_compat(index, buffer, cursor, df, upl, syncd, sync)
                }
            };

            match result {
                Ok(report) => {
                    self.stats.bb_crc_errors += report.crc_errors as u64;
                    self.stats.bb_fragment_drops += report.fragment_drops as u64;
                }
                Err(e) => {
                    self.stats.bb_fragment_drops += 1;
                    if let Some(n) = self.bb_log.bump() {
                        debug!("user packet reassembly failed on feed {}: {} ({} times total)", index, e, n);
                    }
                }
            }
        }
    }
}

impl DispatchCore {
    /// Reassemble for the TS compatibility feed at `index`. Flushed 188-byte
    /// packets re-enter the dispatcher, which needs the whole core, so the
    /// feed's buffer is moved out for the duration.
    #[allow(clippy::too_many_arguments)]
    fn reassemble_ts_compat(
        &mut self,
        index: usize,
        mut buffer: Vec<u8>,
        mut cursor: UpCursor,
        df: &[u8],
        upl: usize,
        syncd: Option<usize>,
        sync: u8,
    ) -> Result<UpReport> {
        let result = reassemble_user_packets(&mut cursor, &mut buffer, df, upl, syncd, sync, &mut |buf, stored| {
            if stored == TS_PACKET_SIZE {
                for packet in buf.chunks_exact(TS_PACKET_SIZE) {
                    self.dispatch_packet(packet);
                }
            }
        });

        if let FeedData::Bb(bb) = &mut self.feeds.slot_mut(index).data {
            bb.buffer = buffer;
            bb.cursor = cursor;
        }
        result
    }
}

fn ts_packet(ts: &mut TsFeed, index: usize, handle: TsFeedHandle, packet: &[u8], hooks: Option<&dyn DemuxHooks>) {
    if ts.ts_type.contains(TsType::PACKET) {
        if ts.ts_type.contains(TsType::PAYLOAD_ONLY) {
            if let Some(payload) = extract_payload(packet, &mut ts.peslen) {
                (ts.callback)(payload, handle, DmxStatus::Ok);
            }
        } else {
            (ts.callback)(packet, handle, DmxStatus::Ok);
        }
    }

    if ts.ts_type.contains(TsType::DECODER) {
        if let Some(hooks) = hooks {
            hooks.write_to_decoder(&ts.info(index), packet);
        }
    }
}

fn section_packet(
    sec: &mut SectionFeed,
    index: usize,
    packet: &[u8],
    filters: &FilterPool,
    stats: &mut DemuxStats,
    hooks: Option<&dyn DemuxHooks>,
) {
    let info = sec.info(index);
    let SectionFeed {
        check_crc,
        filters: chain,
        reassembler,
        callback,
        ..
    } = sec;
    let check_crc = *check_crc;
    let mut sections = 0u64;
    let mut crc_errors = 0u64;

    let report = reassembler.feed_packet(
        packet,
        &mut |dst, src| match hooks {
            Some(hooks) => hooks.memcopy(&info, dst, src),
            None => dst.copy_from_slice(src),
        },
        &mut |section| {
            if check_crc && section[1] & 0x80 != 0 {
                let residue = match hooks {
                    Some(hooks) => hooks.check_crc32(&info, section),
                    None => crc32_mpeg2(section),
                };
                if residue != 0 {
                    crc_errors += 1;
                    return;
                }
            }

            sections += 1;
            // Newest filter first.
            for &f in chain.iter().rev() {
                if filters.slot(f).prepared.matches(section) {
                    callback(section, FilterHandle(filters.id(f)), DmxStatus::Ok);
                }
            }
        },
    );

    stats.sections += sections;
    stats.section_crc_errors += crc_errors;
    stats.section_overflow_bytes += report.overflow_bytes as u64;
    if report.discontinuity {
        stats.section_discontinuities += 1;
        debug!("section discontinuity on PID 0x{:04X} (feed {})", info.pid.unwrap_or_default(), index);
    }
    if report.pointer_error {
        stats.pointer_errors += 1;
    }
}
