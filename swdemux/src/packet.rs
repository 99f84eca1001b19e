//! MPEG-TS packet layout helpers.
//!
//! All helpers take an already synchronised 188-byte packet. Field offsets follow
//! ISO/IEC 13818-1.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS packet size including 16 Reed-Solomon bytes.
pub const TS_PACKET_SIZE_204: usize = 204;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Inverted sync byte, accepted as an alternate marker in 204-byte framing.
pub const SYNC_BYTE_INVERTED: u8 = 0xB8;

/// Largest valid PID.
pub const MAX_PID: u16 = 0x1FFF;

/// Pseudo PID that selects every packet.
pub const PID_WILDCARD: u16 = 0x2000;

/// Payload bytes available in a packet without adaptation field.
pub const MAX_PAYLOAD: usize = TS_PACKET_SIZE - 4;

/// PID of a packet (13 bits from bytes 1-2).
#[inline]
pub fn pid(packet: &[u8]) -> u16 {
    ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16
}

/// Transport error indicator.
#[inline]
pub fn transport_error(packet: &[u8]) -> bool {
    packet[1] & 0x80 != 0
}

/// Payload unit start indicator.
#[inline]
pub fn payload_unit_start(packet: &[u8]) -> bool {
    packet[1] & 0x40 != 0
}

/// Whether the adaptation field control announces a payload.
#[inline]
pub fn has_payload(packet: &[u8]) -> bool {
    packet[3] & 0x10 != 0
}

/// Continuity counter (low nibble of byte 3).
#[inline]
pub fn continuity_counter(packet: &[u8]) -> u8 {
    packet[3] & 0x0F
}

/// Number of payload bytes carried by the packet.
///
/// Returns 0 when there is no payload, or when the adaptation field length
/// byte exceeds 183 (corrupted packet). The payload occupies the last `n`
/// bytes of the 188-byte packet.
#[inline]
pub fn payload_len(packet: &[u8]) -> usize {
    if !has_payload(packet) {
        return 0;
    }

    if packet[3] & 0x20 != 0 {
        let af_length = packet[4] as usize;
        if af_length > 183 {
            return 0;
        }
        return MAX_PAYLOAD - 1 - af_length;
    }

    MAX_PAYLOAD
}

/// Discontinuity indicator of the adaptation field, if one is present.
#[inline]
pub fn discontinuity_indicator(packet: &[u8]) -> bool {
    packet[3] & 0x20 != 0 && packet[4] > 0 && packet[5] & 0x80 != 0
}

/// Total length of a section (3 header bytes + 12-bit `section_length`).
///
/// `buf` must hold at least the first 3 bytes of the section.
#[inline]
pub fn section_length(buf: &[u8]) -> usize {
    3 + (((buf[1] & 0x0F) as usize) << 8) + buf[2] as usize
}
