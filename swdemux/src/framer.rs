//! Byte-stream framer for 188 and 204 byte transport packets.
//!
//! The framer turns arbitrarily chunked input into whole packets. A partial
//! packet at the end of a chunk is kept in a one-packet residual buffer and
//! completed by the next call. Garbage between packets is skipped byte by
//! byte until the next sync byte.

use crate::packet::{SYNC_BYTE, SYNC_BYTE_INVERTED, TS_PACKET_SIZE, TS_PACKET_SIZE_204};

/// Input framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// Plain 188-byte packets.
    Ts188,
    /// 188-byte packets followed by 16 Reed-Solomon bytes.
    Ts204,
}

impl FrameFormat {
    /// Distance between two packet starts.
    pub fn frame_size(self) -> usize {
        match self {
            FrameFormat::Ts188 => TS_PACKET_SIZE,
            FrameFormat::Ts204 => TS_PACKET_SIZE_204,
        }
    }

    fn is_sync(self, byte: u8) -> bool {
        byte == SYNC_BYTE || (self == FrameFormat::Ts204 && byte == SYNC_BYTE_INVERTED)
    }
}

/// Find the next packet start at or after `pos`.
///
/// Returns the position (equal to `buf.len()` when there is none) and the
/// number of skipped bytes. When bytes had to be skipped and the position one
/// frame before the found sync byte is itself a sync byte, that earlier
/// alignment is trusted instead and nothing counts as lost.
pub(crate) fn find_next_packet(buf: &[u8], pos: usize, format: FrameFormat) -> (usize, usize) {
    let start = pos;
    let pos = buf[start.min(buf.len())..]
        .iter()
        .position(|&b| format.is_sync(b))
        .map_or(buf.len(), |offset| start + offset);

    let lost = pos - start;
    if lost > 0 {
        if let Some(backtrack) = pos.checked_sub(format.frame_size()) {
            if format.is_sync(buf[backtrack]) {
                return (backtrack, 0);
            }
        }
    }

    (pos, lost)
}

/// Framer state kept between two calls.
pub(crate) struct TsFramer {
    residual: [u8; TS_PACKET_SIZE_204],
    residual_len: usize,
    format: FrameFormat,
}

impl TsFramer {
    pub fn new() -> Self {
        Self {
            residual: [0; TS_PACKET_SIZE_204],
            residual_len: 0,
            format: FrameFormat::Ts188,
        }
    }

    /// Format of the most recent call.
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Number of bytes waiting for the rest of their packet.
    pub fn pending(&self) -> usize {
        self.residual_len
    }

    /// Frame `data` and hand every complete 188-byte packet to `dispatch`.
    ///
    /// Returns the number of bytes skipped as garbage. A switch of the framing
    /// format discards the residual.
    pub fn push(&mut self, format: FrameFormat, data: &[u8], dispatch: &mut dyn FnMut(&[u8])) -> usize {
        if format != self.format {
            self.format = format;
            self.residual_len = 0;
        }

        let frame_size = format.frame_size();
        let mut lost = 0;
        let mut p = 0;

        if self.residual_len > 0 {
            let need = frame_size - self.residual_len;
            if data.len() < need {
                self.residual[self.residual_len..self.residual_len + data.len()].copy_from_slice(data);
                self.residual_len += data.len();
                return 0;
            }

            self.residual[self.residual_len..frame_size].copy_from_slice(&data[..need]);
            if self.residual[0] == SYNC_BYTE {
                dispatch(&self.residual[..TS_PACKET_SIZE]);
            }
            self.residual_len = 0;
            p = need;
        }

        loop {
            let (next, skipped) = find_next_packet(data, p, format);
            lost += skipped;
            p = next;
            if p >= data.len() || data.len() - p < frame_size {
                break;
            }

            let packet = &data[p..p + TS_PACKET_SIZE];
            if packet[0] == SYNC_BYTE_INVERTED {
                let mut scratch = [0u8; TS_PACKET_SIZE];
                scratch.copy_from_slice(packet);
                scratch[0] = SYNC_BYTE;
                dispatch(&scratch);
            } else {
                dispatch(packet);
            }
            p += frame_size;
        }

        let rest = data.len() - p;
        if rest > 0 {
            self.residual[..rest].copy_from_slice(&data[p..]);
            self.residual_len = rest;
            if self.residual[0] == SYNC_BYTE_INVERTED {
                self.residual[0] = SYNC_BYTE;
            }
        }

        lost
    }
}
