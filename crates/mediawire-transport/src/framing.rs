//! # Framing Codec
//!
//! Wraps payloads in the 16-byte unit header and recovers them from a byte
//! stream whose read boundaries need not line up with unit boundaries.
//!
//! ## Responsibilities
//!
//! - **Packing**: sequence numbering, millisecond timestamps, CRC8, one
//!   reusable transmit buffer per channel
//! - **Unpacking**: header validation, payload reassembly across calls via a
//!   bounded partial-unit buffer, CRC verification
//!
//! A bad magic never triggers a forward scan. The current call stops and any
//! cached partial unit is discarded.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::{trace, warn};

use crate::stats::{PackStats, UnpackStats};
use crate::wire::{HeaderError, WireHeader, HEADER_SIZE, MAX_PAYLOAD_LEN};

// ─── SequenceGenerator ──────────────────────────────────────────────────────

/// Per-channel 16-bit unit sequence. The first unit carries 1.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: u16,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator { last: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        self.last = self.last.wrapping_add(1);
        self.last
    }

    /// Sequence of the most recently issued unit (0 before the first).
    pub fn current(&self) -> u16 {
        self.last
    }
}

// ─── TimestampClock ─────────────────────────────────────────────────────────

/// Millisecond clock for unit timestamps.
/// Wraps every ~49.7 days (u32::MAX ms).
pub struct TimestampClock {
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        TimestampClock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u32 {
        let elapsed = self.epoch.elapsed();
        (elapsed.as_millis() as u64 & 0xFFFF_FFFF) as u32
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Packer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    #[error("payload of {len} bytes exceeds transmit capacity {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Transmit half of the framing codec.
pub struct Packer {
    tx_buf: BytesMut,
    max_tx_size: usize,
    seq: SequenceGenerator,
    clock: TimestampClock,
    stats: PackStats,
}

impl Packer {
    /// `max_tx_size` is the largest payload accepted; it is clamped to what
    /// the 16-bit length field can carry.
    pub fn new(max_tx_size: usize) -> Self {
        let max_tx_size = max_tx_size.min(MAX_PAYLOAD_LEN);
        Packer {
            tx_buf: BytesMut::with_capacity(HEADER_SIZE + max_tx_size),
            max_tx_size,
            seq: SequenceGenerator::new(),
            clock: TimestampClock::new(),
            stats: PackStats::default(),
        }
    }

    pub fn max_tx_size(&self) -> usize {
        self.max_tx_size
    }

    /// Frame `payload`. The returned view stays valid until the next call.
    pub fn pack(&mut self, payload: &[u8]) -> Result<&[u8], PackError> {
        if payload.len() > self.max_tx_size {
            self.stats.oversized += 1;
            return Err(PackError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_tx_size,
            });
        }

        let header = WireHeader::for_payload(self.seq.next(), self.clock.now_ms(), payload);
        self.tx_buf.clear();
        header.encode(&mut self.tx_buf);
        self.tx_buf.extend_from_slice(payload);

        self.stats.units_packed += 1;
        self.stats.bytes_packed += payload.len() as u64;
        trace!(seq = header.sequence, len = payload.len(), "packed unit");
        Ok(&self.tx_buf[..])
    }

    /// Sequence of the last packed unit.
    pub fn last_sequence(&self) -> u16 {
        self.seq.current()
    }

    pub fn stats(&self) -> PackStats {
        self.stats.clone()
    }
}

// ─── Unpacker ───────────────────────────────────────────────────────────────

/// One unit recovered from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedUnit {
    pub sequence: u16,
    pub timestamp_ms: u32,
    pub flags: u16,
    pub payload: Bytes,
    /// False when the header carried a CRC that did not match.
    pub crc_ok: bool,
}

/// Receive half of the framing codec.
pub struct Unpacker {
    /// Bytes of the unit in progress, header first. Never exceeds
    /// `HEADER_SIZE + max_rx_size`.
    partial: BytesMut,
    max_rx_size: usize,
    stats: UnpackStats,
}

impl Unpacker {
    pub fn new(max_rx_size: usize) -> Self {
        let max_rx_size = max_rx_size.min(MAX_PAYLOAD_LEN);
        Unpacker {
            partial: BytesMut::with_capacity(HEADER_SIZE + max_rx_size),
            max_rx_size,
            stats: UnpackStats::default(),
        }
    }

    pub fn max_rx_size(&self) -> usize {
        self.max_rx_size
    }

    /// Bytes currently cached for an incomplete unit.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Feed stream bytes, invoking `on_unit` for every complete unit.
    /// Returns the number of units emitted by this call.
    pub fn unpack<F>(&mut self, mut data: &[u8], mut on_unit: F) -> usize
    where
        F: FnMut(UnpackedUnit),
    {
        let mut emitted = 0;

        while !data.is_empty() {
            if self.partial.is_empty() {
                if data.len() < HEADER_SIZE {
                    self.partial.extend_from_slice(data);
                    break;
                }
                let header = match WireHeader::decode(data) {
                    Ok(h) => h,
                    Err(e) => {
                        self.reject_header(e);
                        break;
                    }
                };
                if !self.accepts(&header) {
                    break;
                }
                let total = header.unit_len();
                if data.len() < total {
                    self.partial.extend_from_slice(data);
                    break;
                }
                let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..total]);
                data = &data[total..];
                on_unit(self.finish(&header, payload));
                emitted += 1;
            } else {
                if self.partial.len() < HEADER_SIZE {
                    let need = HEADER_SIZE - self.partial.len();
                    if data.len() < need {
                        self.partial.extend_from_slice(data);
                        break;
                    }
                    self.partial.extend_from_slice(&data[..need]);
                    data = &data[need..];
                }

                let header = match WireHeader::decode(&self.partial) {
                    Ok(h) => h,
                    Err(e) => {
                        self.reject_header(e);
                        self.reset_partial();
                        break;
                    }
                };
                if !self.accepts(&header) {
                    self.reset_partial();
                    break;
                }

                let total = header.unit_len();
                let need = total - self.partial.len();
                if data.len() < need {
                    self.partial.extend_from_slice(data);
                    break;
                }
                self.partial.extend_from_slice(&data[..need]);
                data = &data[need..];

                let payload = Bytes::copy_from_slice(&self.partial[HEADER_SIZE..total]);
                self.partial.clear();
                on_unit(self.finish(&header, payload));
                emitted += 1;
            }
        }

        emitted
    }

    /// Throw away any cached partial unit.
    pub fn reset(&mut self) {
        if !self.partial.is_empty() {
            self.reset_partial();
        }
    }

    pub fn stats(&self) -> UnpackStats {
        self.stats.clone()
    }

    fn accepts(&mut self, header: &WireHeader) -> bool {
        if header.length as usize > self.max_rx_size {
            self.stats.oversized += 1;
            warn!(
                len = header.length,
                max = self.max_rx_size,
                seq = header.sequence,
                "unit exceeds receive capacity"
            );
            return false;
        }
        true
    }

    fn reject_header(&mut self, err: HeaderError) {
        if let HeaderError::BadMagic { .. } = err {
            self.stats.bad_magic += 1;
        }
        warn!(error = %err, cached = self.partial.len(), "dropping stream bytes");
    }

    fn reset_partial(&mut self) {
        self.partial.clear();
        self.stats.partial_resets += 1;
    }

    fn finish(&mut self, header: &WireHeader, payload: Bytes) -> UnpackedUnit {
        let crc_ok = header.verify(&payload);
        if !crc_ok {
            self.stats.crc_mismatches += 1;
            warn!(
                seq = header.sequence,
                expected = header.crc,
                len = payload.len(),
                "crc8 mismatch"
            );
        }
        self.stats.units_unpacked += 1;
        self.stats.bytes_unpacked += payload.len() as u64;
        trace!(seq = header.sequence, len = payload.len(), crc_ok, "unpacked unit");
        UnpackedUnit {
            sequence: header.sequence,
            timestamp_ms: header.timestamp_ms,
            flags: header.flags,
            payload,
            crc_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MAGIC;

    fn collect(unpacker: &mut Unpacker, data: &[u8]) -> Vec<UnpackedUnit> {
        let mut out = Vec::new();
        unpacker.unpack(data, |u| out.push(u));
        out
    }

    // ─── Packer ─────────────────────────────────────────────────────────

    #[test]
    fn sequence_starts_at_one_and_wraps() {
        let mut gen = SequenceGenerator::new();
        assert_eq!(gen.current(), 0);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);

        let mut gen = SequenceGenerator { last: u16::MAX - 1 };
        assert_eq!(gen.next(), u16::MAX);
        assert_eq!(gen.next(), 0);
    }

    #[test]
    fn timestamp_clock_monotonic() {
        let clock = TimestampClock::new();
        let t1 = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock.now_ms();
        assert!(t2 >= t1);
    }

    #[test]
    fn pack_writes_header_and_payload() {
        let mut packer = Packer::new(64);
        let unit = packer.pack(b"abc").unwrap().to_vec();
        assert_eq!(unit.len(), HEADER_SIZE + 3);
        let hdr = WireHeader::decode(&unit).unwrap();
        assert_eq!(hdr.sequence, 1);
        assert_eq!(hdr.length, 3);
        assert!(hdr.verify(&unit[HEADER_SIZE..]));
        assert_eq!(&unit[HEADER_SIZE..], b"abc");

        packer.pack(b"d").unwrap();
        assert_eq!(packer.last_sequence(), 2);
        assert_eq!(packer.stats().units_packed, 2);
        assert_eq!(packer.stats().bytes_packed, 4);
    }

    #[test]
    fn pack_rejects_oversized_payload() {
        let mut packer = Packer::new(8);
        let err = packer.pack(&[0u8; 9]).unwrap_err();
        assert_eq!(err, PackError::PayloadTooLarge { len: 9, max: 8 });
        assert_eq!(packer.stats().oversized, 1);
        assert_eq!(packer.last_sequence(), 0);
    }

    // ─── Unpacker ───────────────────────────────────────────────────────

    #[test]
    fn unpack_single_unit() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let unit = packer.pack(b"payload").unwrap().to_vec();

        let out = collect(&mut unpacker, &unit);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 1);
        assert_eq!(&out[0].payload[..], b"payload");
        assert!(out[0].crc_ok);
        assert_eq!(unpacker.pending(), 0);
    }

    #[test]
    fn unpack_back_to_back_units_in_one_call() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let mut stream = Vec::new();
        for p in [&b"one"[..], b"two", b"three"] {
            stream.extend_from_slice(packer.pack(p).unwrap());
        }
        let out = collect(&mut unpacker, &stream);
        let payloads: Vec<&[u8]> = out.iter().map(|u| &u.payload[..]).collect();
        assert_eq!(payloads, vec![&b"one"[..], b"two", b"three"]);
        assert_eq!(out[2].sequence, 3);
    }

    #[test]
    fn unpack_header_split_across_calls() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let unit = packer.pack(b"split").unwrap().to_vec();

        assert!(collect(&mut unpacker, &unit[..5]).is_empty());
        assert_eq!(unpacker.pending(), 5);
        assert!(collect(&mut unpacker, &unit[5..18]).is_empty());
        let out = collect(&mut unpacker, &unit[18..]);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"split");
        assert_eq!(unpacker.pending(), 0);
    }

    #[test]
    fn unpack_bad_magic_stops_call() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let mut unit = packer.pack(b"junk").unwrap().to_vec();
        unit[0] = 0x00;
        let good = packer.pack(b"good").unwrap().to_vec();
        unit.extend_from_slice(&good);

        assert!(collect(&mut unpacker, &unit).is_empty());
        assert_eq!(unpacker.stats().bad_magic, 1);
        assert_eq!(unpacker.pending(), 0);

        // The stream recovers on the next aligned unit.
        let out = collect(&mut unpacker, &good);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn unpack_bad_magic_in_cached_header_resets() {
        let mut unpacker = Unpacker::new(64);
        let junk = [0x12u8; 10];
        assert!(collect(&mut unpacker, &junk).is_empty());
        assert_eq!(unpacker.pending(), 10);

        assert!(collect(&mut unpacker, &junk).is_empty());
        assert_eq!(unpacker.pending(), 0);
        assert_eq!(unpacker.stats().bad_magic, 1);
        assert_eq!(unpacker.stats().partial_resets, 1);
    }

    #[test]
    fn unpack_rejects_length_over_capacity() {
        let mut packer = Packer::new(256);
        let mut unpacker = Unpacker::new(16);
        let unit = packer.pack(&[7u8; 100]).unwrap().to_vec();

        assert!(collect(&mut unpacker, &unit).is_empty());
        assert_eq!(unpacker.stats().oversized, 1);
        assert_eq!(unpacker.pending(), 0);

        // Same outcome when the header arrives in pieces.
        assert!(collect(&mut unpacker, &unit[..9]).is_empty());
        assert!(collect(&mut unpacker, &unit[9..]).is_empty());
        assert_eq!(unpacker.stats().oversized, 2);
        assert_eq!(unpacker.pending(), 0);
    }

    #[test]
    fn unpack_crc_mismatch_still_emits() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let mut unit = packer.pack(b"integrity").unwrap().to_vec();
        let last = unit.len() - 1;
        unit[last] ^= 0xFF;

        let out = collect(&mut unpacker, &unit);
        assert_eq!(out.len(), 1);
        assert!(!out[0].crc_ok);
        assert_eq!(unpacker.stats().crc_mismatches, 1);
    }

    #[test]
    fn unpack_zero_length_unit() {
        let mut packer = Packer::new(64);
        let mut unpacker = Unpacker::new(64);
        let unit = packer.pack(b"").unwrap().to_vec();
        let out = collect(&mut unpacker, &unit);
        assert_eq!(out.len(), 1);
        assert!(out[0].payload.is_empty());
        assert!(out[0].crc_ok);
    }

    #[test]
    fn reset_discards_cached_bytes() {
        let mut unpacker = Unpacker::new(64);
        let head = MAGIC.to_be_bytes();
        collect(&mut unpacker, &head);
        assert_eq!(unpacker.pending(), 2);
        unpacker.reset();
        assert_eq!(unpacker.pending(), 0);
    }
}
