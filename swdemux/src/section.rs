//! Section reassembly and payload extraction.
//!
//! A section feed accumulates packet payloads in a bounded buffer and cuts
//! complete sections out of it using the 12-bit `section_length` field.
//! Sections are only handed on after a PUSI packet has been seen since the
//! last (re)start, so the tail of a section that began before the feed was
//! attached is never delivered.

use crate::packet::{
    continuity_counter, discontinuity_indicator, payload_len, payload_unit_start, section_length,
    TS_PACKET_SIZE,
};

/// Largest section accepted (including the 3 header bytes).
pub const MAX_SECTION_SIZE: usize = 4096;

/// Capacity of the per-feed reassembly buffer.
pub const MAX_SECFEED_SIZE: usize = MAX_SECTION_SIZE + TS_PACKET_SIZE;

/// PES length value after a PUSI packet.
pub const PESLEN_RESET: u16 = 0xFFFA;

/// What happened while feeding one packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionReport {
    /// Continuity jump or discontinuity indicator discarded the pending data.
    pub discontinuity: bool,
    /// Bytes dropped because the buffer was full.
    pub overflow_bytes: usize,
    /// PUSI packet with an unusable pointer field.
    pub pointer_error: bool,
}

/// Per-feed section reassembly state.
pub(crate) struct SectionReassembler {
    buffer: Box<[u8]>,
    /// Start of the oldest section not yet consumed.
    secbufp: usize,
    /// End of buffered data.
    tsfeedp: usize,
    /// Continuity counter of the last payload packet.
    cc: Option<u8>,
    /// A section boundary has been seen since the last reset.
    pusi_seen: bool,
}

impl SectionReassembler {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; MAX_SECFEED_SIZE].into_boxed_slice(),
            secbufp: 0,
            tsfeedp: 0,
            cc: None,
            pusi_seen: false,
        }
    }

    /// Forget all buffered data and the boundary latch (start of filtering).
    pub fn reset(&mut self) {
        self.new_section();
        self.cc = None;
        self.pusi_seen = false;
    }

    #[cfg(test)]
    pub fn cursors(&self) -> (usize, usize) {
        (self.secbufp, self.tsfeedp)
    }

    fn new_section(&mut self) {
        self.secbufp = 0;
        self.tsfeedp = 0;
    }

    /// Feed one 188-byte packet of the feed's PID.
    ///
    /// `copy` moves payload bytes into the buffer (the memcopy hook),
    /// `deliver` receives every complete section once a boundary was seen.
    pub fn feed_packet(
        &mut self,
        packet: &[u8],
        copy: &mut dyn FnMut(&mut [u8], &[u8]),
        deliver: &mut dyn FnMut(&[u8]),
    ) -> SectionReport {
        let mut report = SectionReport::default();

        let count = payload_len(packet);
        if count == 0 {
            return report;
        }
        let p = TS_PACKET_SIZE - count;

        let cc = continuity_counter(packet);
        let cc_ok = self.cc.map_or(true, |prev| (prev + 1) & 0x0F == cc);
        self.cc = Some(cc);

        if !cc_ok || discontinuity_indicator(packet) {
            report.discontinuity = true;
            self.pusi_seen = false;
            self.new_section();
        }

        if payload_unit_start(packet) {
            let pointer = packet[p] as usize;
            if count > 1 && pointer < count {
                let before = &packet[p + 1..p + 1 + pointer];
                let after = &packet[p + 1 + pointer..];

                self.copy_dump(before, copy, deliver, &mut report);
                self.pusi_seen = true;
                self.new_section();
                self.copy_dump(after, copy, deliver, &mut report);
            } else {
                report.pointer_error = true;
            }
        } else {
            self.copy_dump(&packet[p..], copy, deliver, &mut report);
        }

        report
    }

    fn copy_dump(
        &mut self,
        data: &[u8],
        copy: &mut dyn FnMut(&mut [u8], &[u8]),
        deliver: &mut dyn FnMut(&[u8]),
        report: &mut SectionReport,
    ) {
        let room = MAX_SECFEED_SIZE - self.tsfeedp;
        let len = data.len().min(room);
        report.overflow_bytes += data.len() - len;
        if len == 0 {
            return;
        }

        copy(&mut self.buffer[self.tsfeedp..self.tsfeedp + len], &data[..len]);
        self.tsfeedp += len;

        // Several short sections may sit in one packet.
        while self.secbufp + 2 < self.tsfeedp {
            let seclen = section_length(&self.buffer[self.secbufp..]);
            if seclen > MAX_SECTION_SIZE || self.secbufp + seclen > self.tsfeedp {
                return;
            }

            if self.pusi_seen {
                deliver(&self.buffer[self.secbufp..self.secbufp + seclen]);
            }
            self.secbufp += seclen;
        }
    }
}

/// Payload of a packet for payload-only feeds.
///
/// Updates the PES length counter: reset on PUSI, then advanced by the
/// payload size. Returns `None` when the packet carries no usable payload.
pub(crate) fn extract_payload<'a>(packet: &'a [u8], peslen: &mut u16) -> Option<&'a [u8]> {
    let count = payload_len(packet);
    if count == 0 {
        return None;
    }

    if payload_unit_start(packet) {
        *peslen = PESLEN_RESET;
    }
    *peslen = peslen.wrapping_add(count as u16);

    Some(&packet[TS_PACKET_SIZE - count..])
}
