//! Group Coded Recording: the 4→5 bit line code the 1541 writes to the
//! disk surface.
//!
//! A 256-byte sector becomes one on-disk GCR sector:
//!
//! ```text
//! SYNC(1)
//! HEADER(10)  = GCR of { $08, checksum, sector, track, id2, id1, $0F, $0F }
//! GAP(9)
//! SYNC(1)
//! DATA(325)   = GCR of { $07, payload[256], checksum, $00, $00 }
//! GAP(8)
//! ```
//!
//! Every 4 raw bytes map to 5 GCR bytes through the nibble table below;
//! decoding uses the inverse table, where an invalid code signals a
//! corrupt image.

use crate::error::{Error, Result};

/// The sync mark (a 10-bit run of ones on the surface).
pub const SYNC: u8 = 0xFF;
/// Inter-field gap filler.
pub const GAP: u8 = 0x55;

pub const HEADER_GCR_LEN: usize = 10;
pub const DATA_GCR_LEN: usize = 325;
/// Full on-disk sector: sync + header + gap + sync + data + gap.
pub const SECTOR_GCR_LEN: usize = 1 + HEADER_GCR_LEN + 9 + 1 + DATA_GCR_LEN + 8;

/// Raw data field fed to the encoder: block-start byte, payload,
/// checksum, two tail bytes.
const DATA_RAW_LEN: usize = 1 + 256 + 1 + 2;

const HEADER_START: u8 = 0x08;
const DATA_START: u8 = 0x07;

/// Nibble → 5-bit GCR code.
static GCR_ENCODE: [u8; 16] = [
    0x0A, 0x0B, 0x12, 0x13, 0x0E, 0x0F, 0x16, 0x17,
    0x09, 0x19, 0x1A, 0x1B, 0x0D, 0x1D, 0x1E, 0x15,
];

/// 5-bit code → nibble, -1 for codes never produced by the encoder.
static GCR_DECODE: [i8; 32] = [
    -1, -1, -1, -1, -1, -1, -1, -1, -1, 8, 0, 1, -1, 12, 4, 5,
    -1, -1, 2, 3, -1, 15, 6, 7, -1, 9, 10, 11, -1, 13, 14, -1,
];

/// Encode 4 raw bytes into 5 GCR bytes.
pub fn encode_group(raw: &[u8; 4]) -> [u8; 5] {
    let mut bits: u64 = 0;
    for &b in raw {
        bits = (bits << 5) | GCR_ENCODE[(b >> 4) as usize] as u64;
        bits = (bits << 5) | GCR_ENCODE[(b & 0x0F) as usize] as u64;
    }
    let mut out = [0u8; 5];
    for (i, o) in out.iter_mut().enumerate() {
        *o = ((bits >> (32 - i * 8)) & 0xFF) as u8;
    }
    out
}

/// Decode 5 GCR bytes back into 4 raw bytes.
pub fn decode_group(gcr: &[u8; 5]) -> Result<[u8; 4]> {
    let mut bits: u64 = 0;
    for &b in gcr {
        bits = (bits << 8) | b as u64;
    }
    let mut out = [0u8; 4];
    for (i, o) in out.iter_mut().enumerate() {
        let hi = GCR_DECODE[((bits >> (35 - i * 10)) & 0x1F) as usize];
        let lo = GCR_DECODE[((bits >> (30 - i * 10)) & 0x1F) as usize];
        if hi < 0 || lo < 0 {
            return Err(Error::Image("invalid GCR code".into()));
        }
        *o = ((hi as u8) << 4) | lo as u8;
    }
    Ok(out)
}

fn encode_into(out: &mut Vec<u8>, raw: &[u8]) {
    debug_assert_eq!(raw.len() % 4, 0);
    for chunk in raw.chunks_exact(4) {
        out.extend_from_slice(&encode_group(&[chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
}

/// Encode one full on-disk sector.
pub fn encode_sector(track: u8, sector: u8, id: [u8; 2], payload: &[u8; 256]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTOR_GCR_LEN);

    // Header field.
    out.push(SYNC);
    let checksum = sector ^ track ^ id[1] ^ id[0];
    let header = [HEADER_START, checksum, sector, track, id[1], id[0], 0x0F, 0x0F];
    encode_into(&mut out, &header);
    out.extend(std::iter::repeat(GAP).take(9));

    // Data field.
    out.push(SYNC);
    let mut raw = Vec::with_capacity(DATA_RAW_LEN);
    raw.push(DATA_START);
    raw.extend_from_slice(payload);
    raw.push(payload.iter().fold(0u8, |acc, &b| acc ^ b));
    raw.push(0);
    raw.push(0);
    encode_into(&mut out, &raw);
    out.extend(std::iter::repeat(GAP).take(8));

    debug_assert_eq!(out.len(), SECTOR_GCR_LEN);
    out
}

/// Decode a 325-byte GCR data field back into the 256-byte payload.
/// Verifies the block-start byte and the checksum.
pub fn decode_data_field(gcr: &[u8]) -> Result<[u8; 256]> {
    if gcr.len() != DATA_GCR_LEN {
        return Err(Error::Image(format!("data field length {}", gcr.len())));
    }
    let mut raw = Vec::with_capacity(DATA_RAW_LEN);
    for chunk in gcr.chunks_exact(5) {
        let group = decode_group(&[chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]])?;
        raw.extend_from_slice(&group);
    }
    if raw[0] != DATA_START {
        return Err(Error::Image(format!("bad data block marker {:#04x}", raw[0])));
    }
    let mut payload = [0u8; 256];
    payload.copy_from_slice(&raw[1..257]);
    let checksum = payload.iter().fold(0u8, |acc, &b| acc ^ b);
    if checksum != raw[257] {
        return Err(Error::Image("data block checksum mismatch".into()));
    }
    Ok(payload)
}

/// Decode the 10-byte header field: returns `(track, sector, id)`.
pub fn decode_header(gcr: &[u8]) -> Result<(u8, u8, [u8; 2])> {
    if gcr.len() != HEADER_GCR_LEN {
        return Err(Error::Image(format!("header length {}", gcr.len())));
    }
    let a = decode_group(&[gcr[0], gcr[1], gcr[2], gcr[3], gcr[4]])?;
    let b = decode_group(&[gcr[5], gcr[6], gcr[7], gcr[8], gcr[9]])?;
    if a[0] != HEADER_START {
        return Err(Error::Image(format!("bad header marker {:#04x}", a[0])));
    }
    let (checksum, sector, track) = (a[1], a[2], a[3]);
    let id = [b[1], b[0]];
    if checksum != sector ^ track ^ b[0] ^ b[1] {
        return Err(Error::Image("header checksum mismatch".into()));
    }
    Ok((track, sector, id))
}

/// Offset of the data-field GCR inside an encoded sector.
pub fn data_field_offset() -> usize {
    1 + HEADER_GCR_LEN + 9 + 1
}
