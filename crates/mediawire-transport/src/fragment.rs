//! # Fragmenter
//!
//! Splits a frame into fixed-size fragments, each prefixed with a
//! [`FragmentHeader`]. Fragments are handed to a sink one at a time; the
//! first sink failure abandons the rest of the frame.

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::stats::FragmentStats;
use crate::wire::{FragmentHeader, FRAGMENT_HEADER_SIZE, MAX_FRAGMENTS};

/// Why a frame could not be fully fragmented.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError<E> {
    /// Nothing to send.
    #[error("empty frame")]
    Empty,
    /// The frame needs more fragments than the 8-bit count can describe.
    #[error("frame needs {needed} fragments, at most {} allowed", MAX_FRAGMENTS)]
    TooManyFragments { needed: usize },
    /// The sink refused fragment `index`; later fragments were not sent.
    #[error("fragment {index} rejected: {source}")]
    Rejected {
        index: u8,
        #[source]
        source: E,
    },
}

/// Send-side fragmentation state for one channel.
pub struct Fragmenter {
    fragment_size: usize,
    scratch: BytesMut,
    stats: FragmentStats,
}

impl Fragmenter {
    /// `fragment_size` is the payload carried per fragment, header excluded.
    pub fn new(fragment_size: usize) -> Self {
        let fragment_size = fragment_size.max(1);
        Fragmenter {
            fragment_size,
            scratch: BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + fragment_size),
            stats: FragmentStats::default(),
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Number of fragments a payload of `len` bytes splits into.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.fragment_size)
    }

    /// Largest frame this fragmenter can carry.
    pub fn max_frame_len(&self) -> usize {
        self.fragment_size * MAX_FRAGMENTS
    }

    /// Split `payload` and push every fragment (header included) into `sink`.
    ///
    /// All fragments carry `frame_id = frame_sequence & 0xFF`. Returns the
    /// number of fragments sent.
    pub fn fragment<E, F>(
        &mut self,
        frame_sequence: u32,
        payload: &[u8],
        mut sink: F,
    ) -> Result<usize, FragmentError<E>>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        if payload.is_empty() {
            self.stats.rejected += 1;
            return Err(FragmentError::Empty);
        }
        let count = self.fragment_count(payload.len());
        if count > MAX_FRAGMENTS {
            self.stats.rejected += 1;
            warn!(len = payload.len(), needed = count, "frame too large to fragment");
            return Err(FragmentError::TooManyFragments { needed: count });
        }

        let frame_id = (frame_sequence & 0xFF) as u8;
        for (i, chunk) in payload.chunks(self.fragment_size).enumerate() {
            let header = FragmentHeader {
                frame_id,
                eof: i + 1 == count,
                index: (i + 1) as u8,
                count: count as u8,
            };
            self.scratch.clear();
            header.encode(&mut self.scratch);
            self.scratch.extend_from_slice(chunk);

            if let Err(source) = sink(&self.scratch) {
                self.stats.sink_failures += 1;
                debug!(frame_id, index = header.index, count, "fragment sink failed, frame abandoned");
                return Err(FragmentError::Rejected {
                    index: header.index,
                    source,
                });
            }
            self.stats.fragments += 1;
            trace!(frame_id, index = header.index, len = chunk.len(), "fragment sent");
        }

        self.stats.frames += 1;
        Ok(count)
    }

    pub fn stats(&self) -> FragmentStats {
        self.stats.clone()
    }
}
