//! # mediawire Wire Format
//!
//! Fixed 16-byte unit header plus the 4-byte fragment sub-header.
//!
//! ## Unit Header (16 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Magic (0xF0D5)         |             Flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Timestamp (ms)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Sequence            |        Payload Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     CRC8      |                Reserved (zero)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Multi-byte fields are big-endian unless the `little-endian` feature is
//! enabled, in which case every field flips together.
//!
//! ## Fragment Header (4 bytes)
//!
//! ```text
//! | frame_id | eof | index (1-based) | count | payload ...
//! ```

use bytes::{Buf, BufMut, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Start-of-unit marker.
pub const MAGIC: u16 = 0xF0D5;

/// Size of the unit header on the wire.
pub const HEADER_SIZE: usize = 16;

/// Size of the fragment sub-header on the wire.
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Largest payload a single unit can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest number of fragments one frame can be split into.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Header flag: the CRC8 byte covers the payload.
pub const FLAG_HAS_CRC: u16 = 1 << 0;

// ─── Byte order ──────────────────────────────────────────────────────────────

#[cfg(not(feature = "little-endian"))]
mod order {
    use bytes::{Buf, BufMut};

    #[inline]
    pub fn put_u16(buf: &mut impl BufMut, v: u16) {
        buf.put_u16(v);
    }

    #[inline]
    pub fn put_u32(buf: &mut impl BufMut, v: u32) {
        buf.put_u32(v);
    }

    #[inline]
    pub fn get_u16(buf: &mut impl Buf) -> u16 {
        buf.get_u16()
    }

    #[inline]
    pub fn get_u32(buf: &mut impl Buf) -> u32 {
        buf.get_u32()
    }
}

#[cfg(feature = "little-endian")]
mod order {
    use bytes::{Buf, BufMut};

    #[inline]
    pub fn put_u16(buf: &mut impl BufMut, v: u16) {
        buf.put_u16_le(v);
    }

    #[inline]
    pub fn put_u32(buf: &mut impl BufMut, v: u32) {
        buf.put_u32_le(v);
    }

    #[inline]
    pub fn get_u16(buf: &mut impl Buf) -> u16 {
        buf.get_u16_le()
    }

    #[inline]
    pub fn get_u32(buf: &mut impl Buf) -> u32 {
        buf.get_u32_le()
    }
}

// ─── CRC8 ────────────────────────────────────────────────────────────────────

/// Reflected form of polynomial 0xD5.
const CRC8_POLY_REFLECTED: u8 = 0xAB;

/// Initial CRC register value.
pub const CRC8_INIT: u8 = 0xFF;

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u8;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 {
                (c >> 1) ^ CRC8_POLY_REFLECTED
            } else {
                c >> 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = build_crc8_table();

/// CRC8 of `data` starting from [`CRC8_INIT`], no final XOR.
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(CRC8_INIT, data)
}

/// Continue a CRC8 computation from an existing register value.
pub fn crc8_update(crc: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(crc, |crc, &b| CRC8_TABLE[(crc ^ b) as usize])
}

// ─── Unit Header ─────────────────────────────────────────────────────────────

/// Why a header could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("header truncated: {available} of 16 bytes")]
    Truncated { available: usize },
    #[error("bad magic 0x{found:04x}")]
    BadMagic { found: u16 },
}

/// Decoded unit header. The magic and reserved bytes are implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub flags: u16,
    pub timestamp_ms: u32,
    pub sequence: u16,
    pub length: u16,
    pub crc: u8,
}

impl WireHeader {
    /// Header for a payload with its CRC8 computed.
    pub fn for_payload(sequence: u16, timestamp_ms: u32, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        WireHeader {
            flags: FLAG_HAS_CRC,
            timestamp_ms,
            sequence,
            length: payload.len() as u16,
            crc: crc8(payload),
        }
    }

    /// Serialize into `buf` (exactly [`HEADER_SIZE`] bytes).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        order::put_u16(buf, MAGIC);
        order::put_u16(buf, self.flags);
        order::put_u32(buf, self.timestamp_ms);
        order::put_u16(buf, self.sequence);
        order::put_u16(buf, self.length);
        buf.put_u8(self.crc);
        buf.put_bytes(0, 3);
    }

    /// Parse the first [`HEADER_SIZE`] bytes of `data`.
    ///
    /// The magic is validated before any other field is trusted.
    pub fn decode(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated {
                available: data.len(),
            });
        }
        let mut buf = &data[..HEADER_SIZE];
        let magic = order::get_u16(&mut buf);
        if magic != MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }
        let flags = order::get_u16(&mut buf);
        let timestamp_ms = order::get_u32(&mut buf);
        let sequence = order::get_u16(&mut buf);
        let length = order::get_u16(&mut buf);
        let crc = buf.get_u8();
        Ok(WireHeader {
            flags,
            timestamp_ms,
            sequence,
            length,
            crc,
        })
    }

    #[inline]
    pub fn has_crc(&self) -> bool {
        self.flags & FLAG_HAS_CRC != 0
    }

    /// Total bytes on the wire for this unit.
    #[inline]
    pub fn unit_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    /// Check `payload` against the header CRC. Always true without `HAS_CRC`.
    pub fn verify(&self, payload: &[u8]) -> bool {
        !self.has_crc() || crc8(payload) == self.crc
    }
}

// ─── Fragment Header ─────────────────────────────────────────────────────────

/// Sub-header prefixed to every fragment of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Low 8 bits of the frame sequence number.
    pub frame_id: u8,
    /// Set on the final fragment only.
    pub eof: bool,
    /// 1-based position of this fragment.
    pub index: u8,
    /// Total fragments in the frame.
    pub count: u8,
}

impl FragmentHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_id);
        buf.put_u8(self.eof as u8);
        buf.put_u8(self.index);
        buf.put_u8(self.count);
    }

    /// Split a fragment into its header and body.
    pub fn decode(data: &[u8]) -> Option<(Self, &[u8])> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        let (head, body) = data.split_at(FRAGMENT_HEADER_SIZE);
        Some((
            FragmentHeader {
                frame_id: head[0],
                eof: head[1] != 0,
                index: head[2],
                count: head[3],
            },
            body,
        ))
    }
}
