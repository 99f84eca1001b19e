//! Checksums used by the demultiplexer.
//!
//! - CRC-32/MPEG-2 for PSI/SI sections (polynomial 0x04C11DB7).
//! - CRC-8 for DVB-S2 base-band headers and user packets (polynomial 0xD5).

/// CRC-32/MPEG-2 lookup table.
static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-8 lookup table for generator polynomial 0xD5 (MSB first, no reflection).
static CRC8_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;
        while j < 8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0xD5;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Calculate CRC-32/MPEG-2 (initial value 0xFFFFFFFF, no final XOR).
///
/// Running it over a complete section including its trailing CRC yields 0
/// when the section is intact.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC32_TABLE[index];
    }
    crc
}

/// Continue a CRC-8 (polynomial 0xD5) computation from `crc`.
///
/// Base-band headers and user packets use an initial value of 0x00.
pub fn crc8(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc = CRC8_TABLE[(crc ^ byte) as usize];
    }
    crc
}
