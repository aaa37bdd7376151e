//! Property-based tests for the mediawire framing and fragmentation layers.
//!
//! These tests verify that packing and unpacking agree for arbitrary
//! payloads, that the unpacker's output does not depend on how the stream is
//! split, and that fragmentation followed by reassembly reproduces any frame.

use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use mediawire_transport::fragment::Fragmenter;
use mediawire_transport::framing::{Packer, UnpackedUnit, Unpacker};
use mediawire_transport::reassembly::{FrameBuffer, Reassembler, ReassemblyHooks};
use mediawire_transport::stats::ReassemblyCounters;
use mediawire_transport::wire::*;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn pack_all(packer: &mut Packer, payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut stream = Vec::new();
    for p in payloads {
        stream.extend_from_slice(packer.pack(p).unwrap());
    }
    stream
}

fn unpack_chunks(max_rx: usize, stream: &[u8], cuts: &[usize]) -> Vec<UnpackedUnit> {
    let mut unpacker = Unpacker::new(max_rx);
    let mut out = Vec::new();
    let mut start = 0;
    for &cut in cuts.iter().chain(std::iter::once(&stream.len())) {
        let cut = cut.clamp(start, stream.len());
        unpacker.unpack(&stream[start..cut], |u| out.push(u));
        start = cut;
    }
    out
}

fn payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8)
}

// ─── Pack / Unpack ───────────────────────────────────────────────────────────

proptest! {
    /// One packed unit decodes to exactly one unit with the same payload.
    #[test]
    fn unpack_inverts_pack(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut packer = Packer::new(2048);
        let unit = packer.pack(&payload).unwrap().to_vec();
        prop_assert_eq!(unit.len(), HEADER_SIZE + payload.len());

        let out = unpack_chunks(2048, &unit, &[]);
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(&out[0].payload[..], &payload[..]);
        prop_assert!(out[0].crc_ok);
        prop_assert_eq!(out[0].sequence, 1);
        prop_assert_eq!(out[0].flags & FLAG_HAS_CRC, FLAG_HAS_CRC);
    }

    /// Splitting the stream at arbitrary points changes nothing.
    #[test]
    fn unpack_is_split_invariant(
        payloads in payloads(),
        mut cuts in prop::collection::vec(0usize..4096, 0..24),
    ) {
        let mut packer = Packer::new(512);
        let stream = pack_all(&mut packer, &payloads);
        cuts.sort_unstable();

        let whole = unpack_chunks(512, &stream, &[]);
        let split = unpack_chunks(512, &stream, &cuts);
        prop_assert_eq!(whole.len(), payloads.len());
        prop_assert_eq!(whole, split);
    }

    /// Any single corrupted payload byte is reported, never swallowed.
    #[test]
    fn corrupted_payload_is_flagged(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        pos in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut packer = Packer::new(256);
        let mut unit = packer.pack(&payload).unwrap().to_vec();
        let idx = HEADER_SIZE + pos.index(payload.len());
        unit[idx] ^= flip;

        let out = unpack_chunks(256, &unit, &[]);
        prop_assert_eq!(out.len(), 1);
        prop_assert!(!out[0].crc_ok);
    }
}

/// Byte-at-a-time delivery, the worst split there is.
#[test]
fn unpack_every_byte_boundary() {
    let payloads: Vec<Vec<u8>> = vec![b"alpha".to_vec(), vec![], vec![0xEE; 300], b"omega".to_vec()];
    let mut packer = Packer::new(512);
    let stream = pack_all(&mut packer, &payloads);

    let whole = unpack_chunks(512, &stream, &[]);
    let cuts: Vec<usize> = (1..stream.len()).collect();
    let split = unpack_chunks(512, &stream, &cuts);
    assert_eq!(whole, split);
    assert_eq!(split.len(), 4);
    for (unit, expected) in split.iter().zip(&payloads) {
        assert_eq!(&unit.payload[..], &expected[..]);
    }
}

// ─── Fragment / Reassemble ───────────────────────────────────────────────────

proptest! {
    /// Lossless fragmentation round-trips any payload for any fragment size.
    #[test]
    fn fragment_then_reassemble(
        len in 1usize..20_000,
        fragment_size in 1usize..3000,
        seq in any::<u32>(),
    ) {
        let mut fragmenter = Fragmenter::new(fragment_size);
        prop_assume!(fragmenter.fragment_count(len) <= MAX_FRAGMENTS);
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| {
            sink.lock().unwrap().push(f.as_slice().to_vec());
        });
        let mut reassembler = Reassembler::new(len, hooks, Arc::new(ReassemblyCounters::default()));

        let mut headers = Vec::new();
        let sent = fragmenter
            .fragment(seq, &payload, |frag| {
                headers.push(FragmentHeader::decode(frag).unwrap().0);
                reassembler.process(frag);
                Ok::<_, std::convert::Infallible>(())
            })
            .unwrap();

        prop_assert_eq!(sent, len.div_ceil(fragment_size));
        prop_assert!(headers.iter().all(|h| h.frame_id == (seq & 0xFF) as u8));
        prop_assert_eq!(headers.iter().filter(|h| h.eof).count(), 1);
        prop_assert!(headers.last().unwrap().eof);

        let delivered = delivered.lock().unwrap();
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(&delivered[0], &payload);
    }

    /// Losing any one fragment of a multi-fragment frame loses that frame
    /// only; the following frame arrives intact.
    #[test]
    fn single_loss_costs_one_frame(
        count in 2usize..12,
        lost in any::<prop::sample::Index>(),
    ) {
        let fragment_size = 64;
        let lost = lost.index(count);
        let first = vec![0x11u8; count * fragment_size];
        let second = vec![0x22u8; count * fragment_size - 5];

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| {
            sink.lock().unwrap().push(f.as_slice().to_vec());
        });
        let mut reassembler = Reassembler::new(count * fragment_size, hooks, Arc::new(ReassemblyCounters::default()));
        let mut fragmenter = Fragmenter::new(fragment_size);

        let mut i = 0;
        fragmenter.fragment(1, &first, |frag| {
            if i != lost {
                reassembler.process(frag);
            }
            i += 1;
            Ok::<_, std::convert::Infallible>(())
        }).unwrap();
        fragmenter.fragment(2, &second, |frag| {
            reassembler.process(frag);
            Ok::<_, std::convert::Infallible>(())
        }).unwrap();

        let delivered = delivered.lock().unwrap();
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(&delivered[0], &second);
    }
}
