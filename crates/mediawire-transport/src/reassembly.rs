//! # Frame Reassembly
//!
//! Rebuilds complete frames from a lossy, possibly reordered fragment stream.
//!
//! ## Responsibilities
//!
//! - **Ingestion** ([`ReassemblyWorker::ingest`]): validate, copy into a pool
//!   slot, queue. Runs on the caller's thread and never waits.
//! - **Reassembly** ([`Reassembler`]): single-frame state machine run by the
//!   worker thread over every ready slot.
//! - **Hand-off** ([`ReassemblyHooks`]): frame buffers come from an allocator
//!   hook, complete frames leave through a deliver hook, and the last buffer
//!   is returned through a release hook on stop.
//!
//! Only the frame in progress is tracked. A fragment is applied only when its
//! index is exactly one past the last applied index, so a single lost
//! fragment costs the whole frame. Index 1 always starts over.

use bytes::Bytes;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::pool::{PushError, Ready, SlotPool};
use crate::stats::{ReassemblyCounters, ReassemblyStats};
use crate::wire::{FragmentHeader, FRAGMENT_HEADER_SIZE};

// ─── FrameBuffer ────────────────────────────────────────────────────────────

/// Destination buffer for one reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Vec<u8>,
    capacity: usize,
    /// Local count of frames this buffer was issued for.
    pub sequence: u32,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        FrameBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hard limit on the frame size; fixed at allocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    /// Append `body` if it fits. Returns false (and writes nothing) otherwise.
    fn try_extend(&mut self, body: &[u8]) -> bool {
        if body.len() > self.remaining() {
            return false;
        }
        self.data.extend_from_slice(body);
        true
    }
}

// ─── Hooks ──────────────────────────────────────────────────────────────────

pub type AllocateFn = Box<dyn FnMut(usize) -> Option<FrameBuffer> + Send>;
pub type DeliverFn = Box<dyn FnMut(FrameBuffer) + Send>;
pub type ReleaseFn = Box<dyn FnMut(FrameBuffer) + Send>;

/// Buffer management callbacks for a reassembler.
pub struct ReassemblyHooks {
    pub allocate: AllocateFn,
    pub deliver: DeliverFn,
    /// Receives the last cache buffer on stop. Dropped when absent.
    pub release: Option<ReleaseFn>,
}

impl ReassemblyHooks {
    /// Heap allocator, the given deliver hook, no release hook.
    pub fn new(deliver: impl FnMut(FrameBuffer) + Send + 'static) -> Self {
        ReassemblyHooks {
            allocate: Box::new(|cap| Some(FrameBuffer::with_capacity(cap))),
            deliver: Box::new(deliver),
            release: None,
        }
    }

    pub fn with_allocator(
        mut self,
        allocate: impl FnMut(usize) -> Option<FrameBuffer> + Send + 'static,
    ) -> Self {
        self.allocate = Box::new(allocate);
        self
    }

    pub fn with_release(mut self, release: impl FnMut(FrameBuffer) + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// State of the cache buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Waiting for an index-1 fragment.
    Init,
    /// Applying fragments of `frame_id`.
    Copying,
    /// Last fragment applied, frame being handed off.
    Complete,
    /// Stopping; no further fragments are accepted.
    Draining,
    /// Frame overran the buffer; waiting for the next index-1 fragment.
    Error,
}

struct CacheBuffer {
    frame: FrameBuffer,
    applied: u8,
    frame_id: u8,
    state: CacheState,
}

impl CacheBuffer {
    fn restart(&mut self, frame_id: u8) {
        self.frame.clear();
        self.applied = 0;
        self.frame_id = frame_id;
        self.state = CacheState::Copying;
    }
}

/// Single-frame reassembly state machine.
///
/// The cache buffer is allocated lazily from the allocator hook on the first
/// fragment seen.
pub struct Reassembler {
    frame_capacity: usize,
    hooks: ReassemblyHooks,
    cache: Option<CacheBuffer>,
    frames_issued: u32,
    counters: Arc<ReassemblyCounters>,
}

impl Reassembler {
    pub fn new(
        frame_capacity: usize,
        hooks: ReassemblyHooks,
        counters: Arc<ReassemblyCounters>,
    ) -> Self {
        Reassembler {
            frame_capacity,
            hooks,
            cache: None,
            frames_issued: 0,
            counters,
        }
    }

    /// `None` until the first fragment arrives.
    pub fn state(&self) -> Option<CacheState> {
        self.cache.as_ref().map(|c| c.state)
    }

    /// Apply one fragment (header included).
    pub fn process(&mut self, fragment: &[u8]) {
        if self.state() == Some(CacheState::Draining) {
            return;
        }
        let Some((hdr, body)) = FragmentHeader::decode(fragment) else {
            ReassemblyCounters::bump(&self.counters.malformed);
            return;
        };
        if hdr.index == 0 {
            ReassemblyCounters::bump(&self.counters.malformed);
            debug!(frame_id = hdr.frame_id, "fragment index 0 ignored");
            return;
        }

        if self.cache.is_none() {
            let Some(mut frame) = (self.hooks.allocate)(self.frame_capacity) else {
                ReassemblyCounters::bump(&self.counters.alloc_failures);
                warn!(capacity = self.frame_capacity, "frame allocator failed, fragment dropped");
                return;
            };
            self.frames_issued = self.frames_issued.wrapping_add(1);
            frame.sequence = self.frames_issued;
            self.cache = Some(CacheBuffer {
                frame,
                applied: 0,
                frame_id: hdr.frame_id,
                state: CacheState::Init,
            });
        }
        let Some(cache) = self.cache.as_mut() else {
            return;
        };

        if hdr.index == 1 {
            if cache.state == CacheState::Copying && cache.applied > 0 {
                ReassemblyCounters::bump(&self.counters.frames_abandoned);
                debug!(
                    frame_id = cache.frame_id,
                    applied = cache.applied,
                    "incomplete frame abandoned"
                );
            }
            cache.restart(hdr.frame_id);
        } else {
            match cache.state {
                CacheState::Copying => {}
                CacheState::Error => {
                    trace!(frame_id = hdr.frame_id, index = hdr.index, "frame in error, fragment skipped");
                    return;
                }
                _ => {
                    ReassemblyCounters::bump(&self.counters.out_of_order);
                    return;
                }
            }
            if hdr.frame_id != cache.frame_id {
                ReassemblyCounters::bump(&self.counters.stale);
                trace!(
                    expected = cache.frame_id,
                    got = hdr.frame_id,
                    "stale fragment discarded"
                );
                return;
            }
            if hdr.index as u16 != cache.applied as u16 + 1 {
                ReassemblyCounters::bump(&self.counters.out_of_order);
                trace!(
                    frame_id = hdr.frame_id,
                    index = hdr.index,
                    expected = cache.applied as u16 + 1,
                    "out-of-order fragment discarded"
                );
                return;
            }
        }

        if !cache.frame.try_extend(body) {
            ReassemblyCounters::bump(&self.counters.overflows);
            warn!(
                frame_id = cache.frame_id,
                len = cache.frame.len() + body.len(),
                capacity = cache.frame.capacity(),
                "frame overflows buffer, aborted"
            );
            cache.frame.clear();
            cache.state = CacheState::Error;
            return;
        }
        cache.applied += 1;
        ReassemblyCounters::bump(&self.counters.fragments_applied);

        if !hdr.eof {
            return;
        }

        cache.state = CacheState::Complete;
        if !cache.frame.is_empty() {
            match (self.hooks.allocate)(self.frame_capacity) {
                Some(mut next) => {
                    self.frames_issued = self.frames_issued.wrapping_add(1);
                    next.sequence = self.frames_issued;
                    let done = mem::replace(&mut cache.frame, next);
                    ReassemblyCounters::bump(&self.counters.frames_delivered);
                    trace!(frame_id = cache.frame_id, len = done.len(), "frame complete");
                    (self.hooks.deliver)(done);
                }
                None => {
                    ReassemblyCounters::bump(&self.counters.alloc_failures);
                    warn!(
                        frame_id = cache.frame_id,
                        len = cache.frame.len(),
                        "frame allocator failed, complete frame dropped"
                    );
                    cache.frame.clear();
                }
            }
        }
        cache.applied = 0;
        cache.state = CacheState::Init;
    }

    /// Stop accepting fragments and hand the cache buffer to the release hook.
    ///
    /// The reassembler stays in [`CacheState::Draining`] afterwards; later
    /// fragments are ignored and no new buffer is allocated.
    pub fn drain(&mut self) {
        match self.cache.as_mut() {
            Some(cache) if cache.state == CacheState::Draining => {}
            Some(cache) => {
                cache.state = CacheState::Draining;
                cache.applied = 0;
                let frame = mem::replace(&mut cache.frame, FrameBuffer::with_capacity(0));
                if let Some(release) = self.hooks.release.as_mut() {
                    release(frame);
                }
            }
            None => {
                self.cache = Some(CacheBuffer {
                    frame: FrameBuffer::with_capacity(0),
                    applied: 0,
                    frame_id: 0,
                    state: CacheState::Draining,
                });
            }
        }
    }
}

// ─── ReassemblyWorker ───────────────────────────────────────────────────────

/// Reassembly sizing.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Capacity of each frame buffer requested from the allocator.
    pub frame_capacity: usize,
    /// Number of pool slots.
    pub pool_slots: usize,
    /// Largest fragment accepted (header included).
    pub slot_size: usize,
    /// Worker wait bound, so it can observe shutdown.
    pub wait_timeout: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 256 * 1024,
            pool_slots: 64,
            slot_size: 1200 + FRAGMENT_HEADER_SIZE,
            wait_timeout: Duration::from_millis(100),
        }
    }
}

/// Why an ingest was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("fragment of {len} bytes carries no payload")]
    TooShort { len: usize },
    #[error("fragment of {len} bytes exceeds slot size {max}")]
    Oversized { len: usize, max: usize },
    #[error("reassembly stopped")]
    Stopped,
}

/// What happened to an accepted ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Queued,
    /// Every slot was busy; the fragment was dropped.
    PoolExhausted,
}

/// Pool plus the thread that drains it into a [`Reassembler`].
pub struct ReassemblyWorker {
    pool: Arc<SlotPool>,
    running: Arc<AtomicBool>,
    counters: Arc<ReassemblyCounters>,
    handle: Option<JoinHandle<Reassembler>>,
    name: String,
}

impl ReassemblyWorker {
    /// Allocate the pool and start the worker thread.
    pub fn spawn(name: &str, config: &ReassemblyConfig, hooks: ReassemblyHooks) -> io::Result<Self> {
        Self::spawn_with_counters(name, config, hooks, Arc::new(ReassemblyCounters::default()))
    }

    /// Like [`spawn`](Self::spawn), accumulating into existing counters so
    /// statistics survive a stop/start cycle.
    pub fn spawn_with_counters(
        name: &str,
        config: &ReassemblyConfig,
        hooks: ReassemblyHooks,
        counters: Arc<ReassemblyCounters>,
    ) -> io::Result<Self> {
        let pool = Arc::new(SlotPool::new(config.pool_slots, config.slot_size));
        let running = Arc::new(AtomicBool::new(true));
        let reassembler = Reassembler::new(config.frame_capacity, hooks, counters.clone());

        let handle = {
            let pool = pool.clone();
            let running = running.clone();
            let wait = config.wait_timeout;
            thread::Builder::new()
                .name(format!("mw-reasm-{name}"))
                .spawn(move || worker_loop(pool, running, reassembler, wait))?
        };
        info!(
            channel = name,
            slots = config.pool_slots,
            slot_size = config.slot_size,
            frame_capacity = config.frame_capacity,
            "reassembly worker started"
        );

        Ok(ReassemblyWorker {
            pool,
            running,
            counters,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    /// Queue one fragment for the worker. Never blocks.
    pub fn ingest(&self, data: &[u8]) -> Result<Ingest, IngestError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(IngestError::Stopped);
        }
        if data.len() <= FRAGMENT_HEADER_SIZE {
            ReassemblyCounters::bump(&self.counters.too_short);
            return Err(IngestError::TooShort { len: data.len() });
        }
        match self.pool.try_push(data) {
            Ok(()) => {
                ReassemblyCounters::bump(&self.counters.ingested);
                Ok(Ingest::Queued)
            }
            Err(PushError::Oversized { len, slot_size }) => {
                ReassemblyCounters::bump(&self.counters.oversized);
                warn!(channel = %self.name, len, max = slot_size, "fragment exceeds slot size");
                Err(IngestError::Oversized {
                    len,
                    max: slot_size,
                })
            }
            Err(PushError::Exhausted) => {
                ReassemblyCounters::bump(&self.counters.pool_exhausted);
                debug!(channel = %self.name, len = data.len(), "fragment pool exhausted, dropped");
                Ok(Ingest::PoolExhausted)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.counters.snapshot()
    }

    /// Stop the worker, join it, and release the cache buffer. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.pool.wake();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(mut reassembler) => reassembler.drain(),
                Err(_) => warn!(channel = %self.name, "reassembly worker panicked"),
            }
            info!(channel = %self.name, "reassembly worker stopped");
        }
    }
}

impl Drop for ReassemblyWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    pool: Arc<SlotPool>,
    running: Arc<AtomicBool>,
    mut reassembler: Reassembler,
    wait: Duration,
) -> Reassembler {
    while running.load(Ordering::Acquire) {
        let first = match pool.wait_ready(wait) {
            Ready::Slot(idx) => idx,
            Ready::Woken | Ready::TimedOut => continue,
        };
        let mut next = Some(first);
        while let Some(idx) = next {
            pool.with_slot(idx, |bytes| reassembler.process(bytes));
            pool.release(idx);
            next = pool.try_ready();
        }
    }
    reassembler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragmenter;
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn frag(frame_id: u8, index: u8, count: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        FragmentHeader {
            frame_id,
            eof: index == count,
            index,
            count,
        }
        .encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    fn collecting(capacity: usize) -> (Reassembler, Arc<Mutex<Vec<Vec<u8>>>>, Arc<ReassemblyCounters>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let counters = Arc::new(ReassemblyCounters::default());
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| {
            sink.lock().unwrap().push(f.as_slice().to_vec());
        });
        (Reassembler::new(capacity, hooks, counters.clone()), out, counters)
    }

    // ─── State machine ──────────────────────────────────────────────────

    #[test]
    fn reassembles_in_order_frame() {
        let (mut r, out, counters) = collecting(64);
        assert_eq!(r.state(), None);
        r.process(&frag(7, 1, 3, b"aa"));
        assert_eq!(r.state(), Some(CacheState::Copying));
        r.process(&frag(7, 2, 3, b"bb"));
        r.process(&frag(7, 3, 3, b"c"));
        assert_eq!(r.state(), Some(CacheState::Init));
        assert_eq!(*out.lock().unwrap(), vec![b"aabbc".to_vec()]);
        assert_eq!(counters.snapshot().frames_delivered, 1);
        assert_eq!(counters.snapshot().fragments_applied, 3);
    }

    #[test]
    fn lost_fragment_drops_frame_and_next_recovers() {
        let (mut r, out, counters) = collecting(64);
        r.process(&frag(1, 1, 3, b"x1"));
        // index 2 lost
        r.process(&frag(1, 3, 3, b"x3"));
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(counters.snapshot().out_of_order, 1);

        r.process(&frag(2, 1, 2, b"y1"));
        r.process(&frag(2, 2, 2, b"y2"));
        assert_eq!(*out.lock().unwrap(), vec![b"y1y2".to_vec()]);
        assert_eq!(counters.snapshot().frames_abandoned, 1);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let (mut r, out, counters) = collecting(64);
        r.process(&frag(3, 1, 2, b"ab"));
        r.process(&frag(3, 1, 2, b"ab"));
        r.process(&frag(3, 2, 2, b"cd"));
        r.process(&frag(3, 2, 2, b"cd"));
        assert_eq!(*out.lock().unwrap(), vec![b"abcd".to_vec()]);
        assert_eq!(counters.snapshot().out_of_order, 1);
    }

    #[test]
    fn stale_frame_id_is_discarded() {
        let (mut r, out, counters) = collecting(64);
        r.process(&frag(4, 1, 3, b"n1"));
        r.process(&frag(3, 2, 3, b"old"));
        r.process(&frag(4, 2, 3, b"n2"));
        r.process(&frag(4, 3, 3, b"n3"));
        assert_eq!(*out.lock().unwrap(), vec![b"n1n2n3".to_vec()]);
        assert_eq!(counters.snapshot().stale, 1);
    }

    #[test]
    fn overflow_aborts_until_next_index_one() {
        let (mut r, out, counters) = collecting(4);
        r.process(&frag(1, 1, 2, b"abc"));
        r.process(&frag(1, 2, 2, b"def"));
        assert_eq!(r.state(), Some(CacheState::Error));
        assert_eq!(counters.snapshot().overflows, 1);

        r.process(&frag(2, 2, 2, b"z"));
        assert_eq!(r.state(), Some(CacheState::Error));

        r.process(&frag(2, 1, 1, b"ok"));
        assert_eq!(*out.lock().unwrap(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn first_fragment_is_not_lost_to_lazy_allocation() {
        let (mut r, out, _) = collecting(16);
        r.process(&frag(9, 1, 1, b"solo"));
        assert_eq!(*out.lock().unwrap(), vec![b"solo".to_vec()]);
    }

    #[test]
    fn allocator_failure_drops_completed_frame() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let counters = Arc::new(ReassemblyCounters::default());
        let mut budget = 1;
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| sink.lock().unwrap().push(f.len()))
            .with_allocator(move |cap| {
                if budget > 0 {
                    budget -= 1;
                    Some(FrameBuffer::with_capacity(cap))
                } else {
                    None
                }
            });
        let mut r = Reassembler::new(32, hooks, counters.clone());

        r.process(&frag(1, 1, 1, b"first"));
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(counters.snapshot().alloc_failures, 1);

        // The old buffer is reused and stays usable.
        assert_eq!(r.state(), Some(CacheState::Init));
    }

    #[test]
    fn drain_hands_buffer_to_release_hook() {
        let released = Arc::new(Mutex::new(0usize));
        let seen = released.clone();
        let hooks = ReassemblyHooks::new(|_| {}).with_release(move |f: FrameBuffer| {
            *seen.lock().unwrap() = f.capacity();
        });
        let mut r = Reassembler::new(128, hooks, Arc::new(ReassemblyCounters::default()));
        r.process(&frag(1, 1, 2, b"half"));
        r.drain();
        assert_eq!(*released.lock().unwrap(), 128);
        assert_eq!(r.state(), Some(CacheState::Draining));

        // A second drain has nothing left to release.
        *released.lock().unwrap() = usize::MAX;
        r.drain();
        assert_eq!(*released.lock().unwrap(), usize::MAX);
    }

    #[test]
    fn drained_reassembler_ignores_fragments() {
        let (mut r, out, counters) = collecting(64);
        r.process(&frag(3, 1, 2, b"head"));
        r.drain();
        r.process(&frag(4, 1, 1, b"hello"));
        r.process(&frag(3, 2, 2, b"tail"));
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(r.state(), Some(CacheState::Draining));
        assert_eq!(counters.snapshot().frames_delivered, 0);
    }

    #[test]
    fn drain_before_first_fragment_blocks_allocation() {
        let allocations = Arc::new(Mutex::new(0usize));
        let seen = allocations.clone();
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| sink.lock().unwrap().push(f.len()))
            .with_allocator(move |cap| {
                *seen.lock().unwrap() += 1;
                Some(FrameBuffer::with_capacity(cap))
            });
        let mut r = Reassembler::new(32, hooks, Arc::new(ReassemblyCounters::default()));
        r.drain();
        r.process(&frag(1, 1, 1, b"late"));
        assert_eq!(*allocations.lock().unwrap(), 0);
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(r.state(), Some(CacheState::Draining));
    }

    #[test]
    fn sequences_frames_locally() {
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let sink = seqs.clone();
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| sink.lock().unwrap().push(f.sequence));
        let mut r = Reassembler::new(16, hooks, Arc::new(ReassemblyCounters::default()));
        r.process(&frag(1, 1, 1, b"a"));
        r.process(&frag(2, 1, 1, b"b"));
        assert_eq!(*seqs.lock().unwrap(), vec![1, 2]);
    }

    // ─── Worker ─────────────────────────────────────────────────────────

    #[test]
    fn worker_delivers_fragmented_frame() {
        let (tx, rx) = mpsc::channel();
        let hooks = ReassemblyHooks::new(move |f: FrameBuffer| {
            let _ = tx.send(f.into_bytes());
        });
        let config = ReassemblyConfig {
            frame_capacity: 8192,
            pool_slots: 8,
            slot_size: 1200 + FRAGMENT_HEADER_SIZE,
            wait_timeout: Duration::from_millis(20),
        };
        let mut worker = ReassemblyWorker::spawn("test", &config, hooks).unwrap();

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut fragmenter = Fragmenter::new(1200);
        fragmenter
            .fragment(42, &payload, |f| worker.ingest(f).map(|_| ()))
            .unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.len(), 3000);
        assert_eq!(&frame[..], &payload[..]);

        worker.shutdown();
        assert!(!worker.is_running());
        assert_eq!(worker.stats().frames_delivered, 1);
        assert_eq!(worker.stats().ingested, 3);
    }

    #[test]
    fn worker_ingest_validation() {
        let config = ReassemblyConfig {
            slot_size: 16,
            pool_slots: 1,
            wait_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let mut worker = ReassemblyWorker::spawn("validate", &config, ReassemblyHooks::new(|_| {})).unwrap();

        assert_eq!(worker.ingest(&[1, 0, 1, 1]), Err(IngestError::TooShort { len: 4 }));
        assert_eq!(
            worker.ingest(&[0u8; 17]),
            Err(IngestError::Oversized { len: 17, max: 16 })
        );
        assert_eq!(worker.stats().too_short, 1);
        assert_eq!(worker.stats().oversized, 1);

        worker.shutdown();
        assert_eq!(worker.ingest(&[1, 1, 1, 1, 9]), Err(IngestError::Stopped));
    }

    #[test]
    fn shutdown_is_idempotent_and_releases() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let hooks = ReassemblyHooks::new(|_| {}).with_release(move |_| flag.store(true, Ordering::SeqCst));
        let config = ReassemblyConfig {
            wait_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let mut worker = ReassemblyWorker::spawn("idem", &config, hooks).unwrap();
        worker.ingest(&frag(1, 1, 2, b"partial")).unwrap();

        // Give the worker a chance to allocate the cache buffer.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while worker.stats().fragments_applied == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        worker.shutdown();
        worker.shutdown();
        assert!(released.load(Ordering::SeqCst));
    }
}
