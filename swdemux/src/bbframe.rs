//! DVB-S2 base-band frame engine.
//!
//! Frame layout (EN 302 307, 5.1.6):
//!
//! ```text
//! | MATYPE (2) | UPL (2) | DFL (2) | SYNC (1) | SYNCD (2) | CRC-8 (1) | data field (DFL bits) |
//! ```
//!
//! MATYPE-1 bits 7-6 select the stream type (`00` packetized generic stream,
//! `01` continuous generic stream, `10` reserved, `11` transport stream) and
//! bit 5 marks a single input stream. MATYPE-2 carries the input stream
//! identifier of multiple input stream signals. UPL, DFL and SYNCD are given
//! in bits.
//!
//! In packetized modes the sync byte of every user packet is replaced on air
//! by the CRC-8 of the preceding packet. [`reassemble_user_packets`] rebuilds
//! the packets, verifies them and hands complete buffers to the feed.

use thiserror::Error;

use crate::crc::crc8;
use crate::error::{DemuxError, Result};

/// Base-band header length.
pub const BB_HEADER_LEN: usize = 10;

/// Largest base-band frame (normal FECFRAME, QPSK 9/10).
pub const BB_MAX_FRAME_LEN: usize = 7274;

/// Size of the stream framer staging buffer.
pub const BB_STAGING_SIZE: usize = 8192;

/// User packet length assumed for transport streams with UPL = 0.
pub const BB_TS_USER_PACKET_LEN: usize = 188;

/// SYNCD value meaning "no user packet starts in this data field".
const SYNCD_NONE: u16 = 0xFFFF;

/// Errors of a single base-band frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BbFrameError {
    /// Frame shorter than a header or longer than the largest frame.
    #[error("Invalid frame length: {0} bytes")]
    Length(usize),

    /// Header CRC-8 mismatch.
    #[error("Header CRC mismatch: calculated 0x{calculated:02X}, received 0x{received:02X}")]
    HeaderCrc { calculated: u8, received: u8 },

    /// Data field empty or longer than the available bytes.
    #[error("Invalid data field length: {dfl} bytes (available: {available})")]
    DataField { dfl: usize, available: usize },

    /// Stream type `10` is reserved.
    #[error("Reserved TS/GS stream type")]
    ReservedMode,

    /// Packetized generic stream with UPL = 0.
    #[error("Invalid user packet length of zero")]
    ZeroUserPacketLength,
}

/// Input stream selector of a base-band feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BbIsi {
    /// Single input stream signal.
    Sis,
    /// Every input stream (frame feeds only).
    All,
    /// One stream of a multiple input stream signal.
    Stream(u8),
}

impl BbIsi {
    /// Whether a feed selecting `self` takes frames of stream `frame`.
    pub fn selects(self, frame: BbIsi) -> bool {
        self == BbIsi::All || self == frame
    }
}

/// What a base-band feed receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BbMode {
    /// Whole frames, header included, of any stream type.
    Frame,
    /// Verified user packets of a packetized generic stream.
    PacketizedGs,
    /// Data fields of a continuous generic stream.
    ContinuousGs,
    /// Verified 188-byte packets of a transport stream.
    Transport,
}

impl BbMode {
    /// Whether the mode needs a reassembly buffer.
    pub fn is_packetized(self) -> bool {
        matches!(self, BbMode::PacketizedGs | BbMode::Transport)
    }
}

/// TS/GS field of MATYPE-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    PacketizedGs,
    ContinuousGs,
    Reserved,
    Transport,
}

/// Parsed base-band header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbHeader {
    pub matype1: u8,
    pub matype2: u8,
    /// User packet length in bits.
    pub upl: u16,
    /// Data field length in bits.
    pub dfl: u16,
    /// User packet sync byte (0 if the stream has none).
    pub sync: u8,
    /// Distance in bits to the first user packet start.
    pub syncd: u16,
    pub crc: u8,
}

impl BbHeader {
    /// Parse and CRC-check the 10-byte header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> std::result::Result<Self, BbFrameError> {
        if frame.len() < BB_HEADER_LEN {
            return Err(BbFrameError::Length(frame.len()));
        }

        let calculated = crc8(0x00, &frame[..9]);
        if calculated != frame[9] {
            return Err(BbFrameError::HeaderCrc {
                calculated,
                received: frame[9],
            });
        }

        Ok(BbHeader {
            matype1: frame[0],
            matype2: frame[1],
            upl: u16::from_be_bytes([frame[2], frame[3]]),
            dfl: u16::from_be_bytes([frame[4], frame[5]]),
            sync: frame[6],
            syncd: u16::from_be_bytes([frame[7], frame[8]]),
            crc: frame[9],
        })
    }

    pub fn stream_type(&self) -> StreamType {
        match self.matype1 & 0xC0 {
            0x00 => StreamType::PacketizedGs,
            0x40 => StreamType::ContinuousGs,
            0x80 => StreamType::Reserved,
            _ => StreamType::Transport,
        }
    }

    /// Input stream of the frame.
    pub fn isi(&self) -> BbIsi {
        if self.matype1 & 0x20 != 0 {
            BbIsi::Sis
        } else {
            BbIsi::Stream(self.matype2)
        }
    }

    /// Data field length in bytes.
    pub fn data_field_len(&self) -> usize {
        (self.dfl >> 3) as usize
    }

    /// User packet length in bytes.
    pub fn user_packet_len(&self) -> usize {
        (self.upl >> 3) as usize
    }

    /// Offset in bytes of the first user packet start, if any.
    pub fn sync_distance(&self) -> Option<usize> {
        if self.syncd == SYNCD_NONE {
            None
        } else {
            Some((self.syncd >> 3) as usize)
        }
    }

    /// Header plus data field length.
    pub fn frame_len(&self) -> usize {
        BB_HEADER_LEN + self.data_field_len()
    }
}

/// Reassembly cursors of a packetized base-band feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpCursor {
    /// Write position.
    pub bufpos: usize,
    /// Start of the oldest unverified packet.
    pub crcpos: usize,
}

impl UpCursor {
    fn reset(&mut self) {
        self.bufpos = 0;
        self.crcpos = 0;
    }
}

/// What happened while processing one data field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpReport {
    /// Packets dropped for a CRC-8 mismatch.
    pub crc_errors: usize,
    /// Partial packets or data fields that could not be placed.
    pub fragment_drops: usize,
}

/// Rebuild user packets from one data field.
///
/// `upl` is the on-air user packet length. When `sync` is 0 the stream has no
/// sync byte and packets are stored one byte shorter. Packets are verified
/// with the CRC-8 carried at the start of the following packet; once the
/// usable part of `buffer` is full of verified packets it is passed to
/// `flush` together with the stored packet length, and the cursors restart.
pub(crate) fn reassemble_user_packets(
    cursor: &mut UpCursor,
    buffer: &mut [u8],
    df: &[u8],
    upl: usize,
    syncd: Option<usize>,
    sync: u8,
    flush: &mut dyn FnMut(&[u8], usize),
) -> Result<UpReport> {
    if upl == 0 {
        return Err(DemuxError::InvalidArgument("user packet length is zero"));
    }
    if matches!(syncd, Some(d) if d >= df.len()) {
        return Err(DemuxError::InvalidArgument("sync distance outside data field"));
    }
    if buffer.is_empty() || upl > buffer.len() {
        return Err(DemuxError::NoBuffer("user packet larger than feed buffer"));
    }

    let stored = if sync == 0 { upl - 1 } else { upl };
    if stored == 0 {
        return Err(DemuxError::InvalidArgument("user packet length is zero"));
    }
    let crc_skip = if sync == 0 { 0 } else { 1 };
    let maxlen = buffer.len() / stored * stored;

    if cursor.crcpos > cursor.bufpos
        || cursor.bufpos > maxlen
        || cursor.crcpos % stored != 0
        || cursor.bufpos - cursor.crcpos > stored
    {
        cursor.reset();
    }

    let mut report = UpReport::default();
    let in_flight = cursor.bufpos - cursor.crcpos;

    let Some(syncd) = syncd else {
        // The whole data field continues the packet in flight, or starts the
        // next one when the stream has no sync byte to mark it.
        if in_flight < stored
            && df.len() <= stored - in_flight
            && cursor.bufpos + df.len() <= maxlen
        {
            buffer[cursor.bufpos..cursor.bufpos + df.len()].copy_from_slice(df);
            cursor.bufpos += df.len();
        } else {
            if in_flight > 0 && in_flight < stored {
                cursor.bufpos = cursor.crcpos;
            }
            report.fragment_drops += 1;
        }
        return Ok(report);
    };

    // Bytes before the first packet start may complete the packet in flight.
    let partial = in_flight % stored;
    if syncd > 0 && in_flight + syncd == stored && cursor.bufpos + syncd <= maxlen {
        buffer[cursor.bufpos..cursor.bufpos + syncd].copy_from_slice(&df[..syncd]);
        cursor.bufpos += syncd;
    } else if partial > 0 || (syncd > 0 && in_flight == 0) {
        cursor.bufpos -= partial;
        report.fragment_drops += 1;
    }

    let mut pos = syncd;
    while pos < df.len() {
        if cursor.bufpos - cursor.crcpos >= stored {
            let start = cursor.crcpos + crc_skip;
            let crc = crc8(0x00, &buffer[start..start + upl - 1]);
            if crc != df[pos] {
                cursor.bufpos -= stored;
                report.crc_errors += 1;
            } else if cursor.bufpos >= maxlen {
                flush(&buffer[..cursor.bufpos], stored);
                cursor.reset();
            } else {
                cursor.crcpos = cursor.bufpos;
            }
        }

        if cursor.bufpos + stored > maxlen {
            cursor.reset();
            report.fragment_drops += 1;
        }

        if sync != 0 {
            buffer[cursor.bufpos] = sync;
            cursor.bufpos += 1;
        }
        pos += 1;

        let len = (upl - 1).min(df.len() - pos);
        buffer[cursor.bufpos..cursor.bufpos + len].copy_from_slice(&df[pos..pos + len]);
        cursor.bufpos += len;
        pos += len;
    }

    Ok(report)
}

/// Whether `buf` starts with a header that passes its CRC and announces a
/// frame of acceptable size.
fn header_plausible(buf: &[u8]) -> Option<usize> {
    if crc8(0x00, &buf[..BB_HEADER_LEN]) != 0 {
        return None;
    }
    let len = BB_HEADER_LEN + (u16::from_be_bytes([buf[4], buf[5]]) >> 3) as usize;
    (len <= BB_MAX_FRAME_LEN).then_some(len)
}

/// Splits a continuous byte stream into base-band frames.
pub(crate) struct BbStreamFramer {
    staging: Box<[u8]>,
    wr: usize,
}

impl BbStreamFramer {
    pub fn new() -> Self {
        Self {
            staging: vec![0u8; BB_STAGING_SIZE].into_boxed_slice(),
            wr: 0,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.wr
    }

    fn stage(&mut self, data: &mut &[u8], want: usize) {
        let n = want.min(data.len()).min(self.staging.len() - self.wr);
        self.staging[self.wr..self.wr + n].copy_from_slice(&data[..n]);
        self.wr += n;
        *data = &data[n..];
    }

    /// Scan `data` for frames and hand each candidate to `on_frame`.
    ///
    /// A header failing its CRC advances the scan by one byte. Returns the
    /// number of bytes skipped.
    pub fn push(&mut self, mut data: &[u8], on_frame: &mut dyn FnMut(&[u8])) -> usize {
        let mut lost = 0;

        // Finish the frame started by an earlier call.
        while self.wr > 0 && !data.is_empty() {
            if self.wr < BB_HEADER_LEN {
                self.stage(&mut data, BB_HEADER_LEN - self.wr);
                continue;
            }

            let Some(frame_len) = header_plausible(&self.staging[..BB_HEADER_LEN]) else {
                self.staging.copy_within(1..self.wr, 0);
                self.wr -= 1;
                lost += 1;
                continue;
            };

            if self.wr < frame_len {
                self.stage(&mut data, frame_len - self.wr);
            }
            if self.wr >= frame_len {
                on_frame(&self.staging[..frame_len]);
                self.staging.copy_within(frame_len..self.wr, 0);
                self.wr -= frame_len;
            }
        }

        if self.wr == 0 {
            while data.len() >= BB_HEADER_LEN {
                let Some(frame_len) = header_plausible(data) else {
                    data = &data[1..];
                    lost += 1;
                    continue;
                };
                if data.len() < frame_len {
                    break;
                }
                on_frame(&data[..frame_len]);
                data = &data[frame_len..];
            }
        }

        let room = self.staging.len() - self.wr;
        if data.len() > room {
            lost += data.len() - room;
            data = &data[..room];
        }
        self.staging[self.wr..self.wr + data.len()].copy_from_slice(data);
        self.wr += data.len();

        lost
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a frame with a valid header CRC.
    pub(crate) fn make_frame(matype1: u8, matype2: u8, upl: usize, sync: u8, syncd: Option<usize>, df: &[u8]) -> Vec<u8> {
        let upl_bits = (upl * 8) as u16;
        let dfl_bits = (df.len() * 8) as u16;
        let syncd_bits = syncd.map_or(SYNCD_NONE, |d| (d * 8) as u16);
        let mut frame = vec![matype1, matype2];
        frame.extend_from_slice(&upl_bits.to_be_bytes());
        frame.extend_from_slice(&dfl_bits.to_be_bytes());
        frame.push(sync);
        frame.extend_from_slice(&syncd_bits.to_be_bytes());
        frame.push(crc8(0x00, &frame));
        frame.extend_from_slice(df);
        frame
    }

    /// 188-byte TS packet with a recognisable body.
    pub(crate) fn user_packet(seq: u8) -> Vec<u8> {
        let mut packet = vec![seq; 188];
        packet[0] = 0x47;
        packet[1] = 0x01;
        packet[2] = 0x00;
        packet[3] = 0x10 | (seq & 0x0F);
        packet
    }

    /// On-air form: each sync byte replaced by the CRC-8 of the previous
    /// packet's data bytes. Returns the stream and the packet start offsets.
    pub(crate) fn mode_adapt(packets: &[Vec<u8>]) -> (Vec<u8>, Vec<usize>) {
        let mut stream = Vec::new();
        let mut starts = Vec::new();
        let mut prev_crc = 0u8;
        for packet in packets {
            starts.push(stream.len());
            stream.push(prev_crc);
            stream.extend_from_slice(&packet[1..]);
            prev_crc = crc8(0x00, &packet[1..]);
        }
        (stream, starts)
    }

    /// Cut the on-air stream into data fields of `dfl` bytes.
    pub(crate) fn slice_into_frames(stream: &[u8], starts: &[usize], dfl: usize) -> Vec<(Option<usize>, Vec<u8>)> {
        stream
            .chunks(dfl)
            .enumerate()
            .map(|(i, chunk)| {
                let begin = i * dfl;
                let syncd = starts
                    .iter()
                    .find(|&&s| s >= begin && s < begin + chunk.len())
                    .map(|&s| s - begin);
                (syncd, chunk.to_vec())
            })
            .collect()
    }

    fn run_frames(
        cursor: &mut UpCursor,
        buffer: &mut [u8],
        frames: &[(Option<usize>, Vec<u8>)],
        sync: u8,
    ) -> (Vec<(Vec<u8>, usize)>, UpReport) {
        let mut flushed = Vec::new();
        let mut total = UpReport::default();
        for (syncd, df) in frames {
            let report = reassemble_user_packets(cursor, buffer, df, 188, *syncd, sync, &mut |buf, upl| {
                flushed.push((buf.to_vec(), upl))
            })
            .unwrap();
            total.crc_errors += report.crc_errors;
            total.fragment_drops += report.fragment_drops;
        }
        (flushed, total)
    }

    #[test]
    fn test_header_parse() {
        let frame = make_frame(0xF0, 0x00, 188, 0x47, Some(3), &[0u8; 20]);
        let header = BbHeader::parse(&frame).unwrap();
        assert_eq!(header.stream_type(), StreamType::Transport);
        assert_eq!(header.isi(), BbIsi::Sis);
        assert_eq!(header.user_packet_len(), 188);
        assert_eq!(header.data_field_len(), 20);
        assert_eq!(header.sync_distance(), Some(3));
        assert_eq!(header.frame_len(), 30);

        let frame = make_frame(0x40, 0x07, 0, 0, None, &[0u8; 4]);
        let header = BbHeader::parse(&frame).unwrap();
        assert_eq!(header.stream_type(), StreamType::ContinuousGs);
        assert_eq!(header.isi(), BbIsi::Stream(7));
        assert_eq!(header.sync_distance(), None);
    }

    #[test]
    fn test_header_crc_gate() {
        let mut frame = make_frame(0xF0, 0x00, 188, 0x47, Some(0), &[0u8; 20]);
        frame[9] ^= 0x01;
        assert!(matches!(BbHeader::parse(&frame), Err(BbFrameError::HeaderCrc { .. })));
        assert!(matches!(BbHeader::parse(&frame[..9]), Err(BbFrameError::Length(9))));
    }

    #[test]
    fn test_isi_selection() {
        assert!(BbIsi::All.selects(BbIsi::Stream(3)));
        assert!(BbIsi::All.selects(BbIsi::Sis));
        assert!(BbIsi::Stream(3).selects(BbIsi::Stream(3)));
        assert!(!BbIsi::Stream(3).selects(BbIsi::Stream(4)));
        assert!(!BbIsi::Sis.selects(BbIsi::Stream(0)));
    }

    #[test]
    fn test_reassembly_flushes_verified_packets() {
        let packets: Vec<Vec<u8>> = (0..9).map(user_packet).collect();
        let (stream, starts) = mode_adapt(&packets);
        let frames = slice_into_frames(&stream, &starts, 500);

        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; 188 * 4 + 10];
        let (flushed, report) = run_frames(&mut cursor, &mut buffer, &frames, 0x47);

        assert_eq!(report.crc_errors, 0);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, packets[0..4].concat());
        assert_eq!(flushed[0].1, 188);
        assert_eq!(flushed[1].0, packets[4..8].concat());
        assert!(cursor.crcpos <= cursor.bufpos);
    }

    #[test]
    fn test_crc_failure_drops_one_packet() {
        let packets: Vec<Vec<u8>> = (0..10).map(user_packet).collect();
        let (mut stream, starts) = mode_adapt(&packets);
        // Corrupt a data byte of packet 5 after its CRC was computed.
        stream[starts[5] + 100] ^= 0xFF;
        let frames = slice_into_frames(&stream, &starts, 333);

        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; 188 * 4];
        let (flushed, report) = run_frames(&mut cursor, &mut buffer, &frames, 0x47);

        assert_eq!(report.crc_errors, 1);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, packets[0..4].concat());
        let expected: Vec<u8> = [&packets[4][..], &packets[6][..], &packets[7][..], &packets[8][..]].concat();
        assert_eq!(flushed[1].0, expected);
    }

    #[test]
    fn test_opaque_data_fields() {
        // Small data fields: most frames carry no packet start.
        let packets: Vec<Vec<u8>> = (0..6).map(user_packet).collect();
        let (stream, starts) = mode_adapt(&packets);
        let frames = slice_into_frames(&stream, &starts, 60);
        assert!(frames.iter().any(|(syncd, _)| syncd.is_none()));

        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; 188 * 2];
        let (flushed, report) = run_frames(&mut cursor, &mut buffer, &frames, 0x47);

        assert_eq!(report.crc_errors, 0);
        assert_eq!(report.fragment_drops, 0);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, packets[0..2].concat());
        assert_eq!(flushed[1].0, packets[2..4].concat());
    }

    #[test]
    fn test_no_sync_byte_stores_shorter_packets() {
        // Generic stream without sync byte: UPL counts the inserted CRC byte.
        let upl = 50;
        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i.wrapping_mul(31); upl - 1]).collect();
        let mut stream = Vec::new();
        let mut starts = Vec::new();
        let mut prev_crc = 0u8;
        for payload in &payloads {
            starts.push(stream.len());
            stream.push(prev_crc);
            stream.extend_from_slice(payload);
            prev_crc = crc8(0x00, payload);
        }
        let frames = slice_into_frames(&stream, &starts, 70);

        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; (upl - 1) * 2 + 5];
        let mut flushed = Vec::new();
        for (syncd, df) in &frames {
            let report = reassemble_user_packets(&mut cursor, &mut buffer, df, upl, *syncd, 0, &mut |buf, stored| {
                flushed.push((buf.to_vec(), stored))
            })
            .unwrap();
            assert_eq!(report.crc_errors, 0);
        }

        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].1, upl - 1);
        assert_eq!(flushed[0].0, payloads[0..2].concat());
        assert_eq!(flushed[1].0, payloads[2..4].concat());
    }

    #[test]
    fn test_no_sync_byte_continuation_at_packet_boundary() {
        // The first data field ends on the CRC of d0, so the next one opens d1
        // without a packet start of its own.
        let upl = 50;
        let d: Vec<Vec<u8>> = (1..=4u8).map(|i| vec![i; upl - 1]).collect();

        let mut f1 = vec![0x00];
        f1.extend_from_slice(&d[0]);
        f1.push(crc8(0x00, &d[0]));
        let f2 = d[1].clone();
        let mut f3 = vec![crc8(0x00, &d[1])];
        for payload in &d[2..] {
            f3.extend_from_slice(payload);
            f3.push(crc8(0x00, payload));
        }
        let frames = [(Some(0), f1), (None, f2), (Some(0), f3)];

        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; (upl - 1) * 4];
        let mut flushed = Vec::new();
        let mut total = UpReport::default();
        for (syncd, df) in &frames {
            let report = reassemble_user_packets(&mut cursor, &mut buffer, df, upl, *syncd, 0, &mut |buf, stored| {
                flushed.push((buf.to_vec(), stored))
            })
            .unwrap();
            total.crc_errors += report.crc_errors;
            total.fragment_drops += report.fragment_drops;
        }

        assert_eq!(total, UpReport::default());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1, upl - 1);
        assert_eq!(flushed[0].0, d.concat());
        assert_eq!(cursor, UpCursor::default());
    }

    #[test]
    fn test_argument_checks() {
        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; 100];
        let mut sink = |_: &[u8], _: usize| {};

        assert!(matches!(
            reassemble_user_packets(&mut cursor, &mut buffer, &[0; 10], 0, Some(0), 0x47, &mut sink),
            Err(DemuxError::InvalidArgument(_))
        ));
        assert!(matches!(
            reassemble_user_packets(&mut cursor, &mut buffer, &[0; 10], 50, Some(10), 0x47, &mut sink),
            Err(DemuxError::InvalidArgument(_))
        ));
        assert!(matches!(
            reassemble_user_packets(&mut cursor, &mut buffer, &[0; 10], 188, Some(0), 0x47, &mut sink),
            Err(DemuxError::NoBuffer(_))
        ));
        assert!(matches!(
            reassemble_user_packets(&mut cursor, &mut [], &[0; 10], 1, Some(0), 0, &mut sink),
            Err(DemuxError::NoBuffer(_))
        ));
    }

    #[test]
    fn test_hostile_data_fields_keep_cursor_invariant() {
        let mut cursor = UpCursor::default();
        let mut buffer = vec![0u8; 188 * 3];
        let mut seed = 0x1234_5678u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for _ in 0..2000 {
            let len = 1 + (next() % 400) as usize;
            let df: Vec<u8> = (0..len).map(|_| next() as u8).collect();
            let syncd = match next() % 3 {
                0 => None,
                _ => Some((next() as usize) % len),
            };
            let upl = 1 + (next() % 300) as usize;
            let sync = if next() % 2 == 0 { 0 } else { 0x47 };
            let _ = reassemble_user_packets(&mut cursor, &mut buffer, &df, upl, syncd, sync, &mut |buf, _| {
                assert!(buf.len() <= 188 * 3)
            });
            assert!(cursor.crcpos <= cursor.bufpos);
            assert!(cursor.bufpos <= buffer.len());
        }
    }

    #[test]
    fn test_stream_framer_resyncs() {
        let f1 = make_frame(0x40, 0, 0, 0, None, &[1u8; 30]);
        let f2 = make_frame(0x40, 0, 0, 0, None, &[2u8; 40]);
        let mut corrupt = make_frame(0x40, 0, 0, 0, None, &[3u8; 20]);
        corrupt[9] ^= 0x55;
        let f3 = make_frame(0x40, 0, 0, 0, None, &[4u8; 25]);

        let mut stream = Vec::new();
        stream.extend_from_slice(&[0x00, 0x00, 0x00]);
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(&f2);
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&f3);

        for chunk_size in [1usize, 7, 50, stream.len()] {
            let mut framer = BbStreamFramer::new();
            let mut frames = Vec::new();
            let mut lost = 0;
            for chunk in stream.chunks(chunk_size) {
                lost += framer.push(chunk, &mut |frame| frames.push(frame.to_vec()));
            }
            assert_eq!(frames, vec![f1.clone(), f2.clone(), f3.clone()], "chunk {}", chunk_size);
            assert_eq!(lost, 3 + corrupt.len(), "chunk {}", chunk_size);
            assert_eq!(framer.pending(), 0);
        }
    }

    #[test]
    fn test_stream_framer_short_inputs() {
        let mut framer = BbStreamFramer::new();
        assert_eq!(framer.push(&[], &mut |_| panic!("no frame expected")), 0);
        assert_eq!(framer.push(&[0x40], &mut |_| panic!("no frame expected")), 0);
        assert_eq!(framer.pending(), 1);
    }
}
