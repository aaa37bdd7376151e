//! # Channels
//!
//! The three fixed logical streams and the per-channel pipeline stages.
//!
//! A channel's capabilities are decided once at build time:
//!
//! - [`PackingStage`] holds the packer and the unpacker together.
//! - [`FragmentationStage`] holds the fragmenter and the reassembly worker
//!   slot together.
//!
//! Either stage may be absent, but a channel can never pack without being
//! able to unpack, or fragment without being able to reassemble.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mediawire_transport::fragment::Fragmenter;
use mediawire_transport::framing::{Packer, Unpacker};
use mediawire_transport::media::{AudioEncoding, FrameKind, VideoFormat};
use mediawire_transport::reassembly::{
    AllocateFn, DeliverFn, FrameBuffer, ReassemblyConfig, ReassemblyHooks, ReassemblyWorker,
    ReleaseFn,
};
use mediawire_transport::stats::{
    CodecStats, DropStats, FragmentStats, ReassemblyCounters, ReassemblyStats,
};

use crate::config::{ChannelConfig, FragmentationConfig, PackingConfig};
use crate::transport::{TransportDriver, TransportSink};

// ─── Identity ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Control,
    Video,
    Audio,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Control, ChannelKind::Video, ChannelKind::Audio];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            ChannelKind::Control => 0,
            ChannelKind::Video => 1,
            ChannelKind::Audio => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::Video => "video",
            ChannelKind::Audio => "audio",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Lifecycle position of a channel.
///
/// `Start` moves a stopped channel to `WaitingConnected`; `Disconnected`
/// moves a connected one back there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChannelState {
    Stopped = 0,
    WaitingConnected = 1,
    Connected = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::WaitingConnected,
            2 => ChannelState::Connected,
            _ => ChannelState::Stopped,
        }
    }
}

/// Atomically updated [`ChannelState`] for all three channels.
#[derive(Debug, Default)]
pub struct ChannelStates([AtomicU8; 3]);

impl ChannelStates {
    pub fn get(&self, kind: ChannelKind) -> ChannelState {
        ChannelState::from_u8(self.0[kind.index()].load(Ordering::Acquire))
    }

    pub fn set(&self, kind: ChannelKind, state: ChannelState) {
        self.0[kind.index()].store(state as u8, Ordering::Release);
    }

    /// Move to `state` unless the channel is stopped. Returns the new state.
    pub fn set_if_started(&self, kind: ChannelKind, state: ChannelState) -> ChannelState {
        let cell = &self.0[kind.index()];
        match cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            (cur != ChannelState::Stopped as u8).then_some(state as u8)
        }) {
            Ok(_) => state,
            Err(cur) => ChannelState::from_u8(cur),
        }
    }
}

// ─── Codec / Frames ─────────────────────────────────────────────────────────

/// Codec metadata handed to the transport with every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "codec")]
pub enum CodecInfo {
    None,
    Video(VideoFormat),
    Audio(AudioEncoding),
}

/// One application frame to send.
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    pub data: Bytes,
    /// Frame sequence; the low 8 bits become the fragment frame id. Assigned
    /// from a per-channel counter when absent.
    pub sequence: Option<u32>,
    /// GOP position for the video drop gate. `Unknown` H.264 frames are
    /// classified from their NAL units.
    pub kind: FrameKind,
}

impl OutgoingFrame {
    pub fn raw(data: impl Into<Bytes>) -> Self {
        OutgoingFrame {
            data: data.into(),
            sequence: None,
            kind: FrameKind::Unknown,
        }
    }

    pub fn video(data: impl Into<Bytes>, kind: FrameKind) -> Self {
        OutgoingFrame {
            data: data.into(),
            sequence: None,
            kind,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Result of a successful [`send`](crate::TransportContext::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport as `units` writes totalling `bytes`.
    Sent { units: usize, bytes: usize },
    /// Refused by the video drop gate.
    Dropped,
}

// ─── Callbacks ──────────────────────────────────────────────────────────────

pub type ReceiveFn = Box<dyn FnMut(ChannelKind, Bytes) + Send>;

/// A replaceable callback.
///
/// The outer lock is held only to clone the current callback out, so a
/// callback may register its own replacement; the replacement serves the
/// next call. A callback must not re-enter its own slot on the same thread.
pub(crate) type Slot<T> = Arc<Mutex<Option<Arc<Mutex<T>>>>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn install<T>(slot: &Mutex<Option<Arc<Mutex<T>>>>, f: T) {
    *lock(slot) = Some(Arc::new(Mutex::new(f)));
}

/// Run `call` against the registered callback without holding the slot lock.
/// `None` when nothing is registered.
pub(crate) fn invoke<T, R>(
    slot: &Mutex<Option<Arc<Mutex<T>>>>,
    call: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    let current = lock(slot).clone()?;
    let mut f = lock(&current);
    Some(call(&mut *f))
}

/// Hand `payload` to the receive callback, if one is registered.
pub(crate) fn deliver_to(
    receive: &Mutex<Option<Arc<Mutex<ReceiveFn>>>>,
    kind: ChannelKind,
    payload: Bytes,
) -> bool {
    invoke(receive, |cb| cb(kind, payload)).is_some()
}

// ─── Stages ─────────────────────────────────────────────────────────────────

pub struct PackingStage {
    pub(crate) packer: Mutex<Packer>,
    pub(crate) unpacker: Mutex<Unpacker>,
}

impl PackingStage {
    fn new(config: &PackingConfig) -> Self {
        PackingStage {
            packer: Mutex::new(Packer::new(config.max_tx_size)),
            unpacker: Mutex::new(Unpacker::new(config.max_rx_size)),
        }
    }

    pub fn stats(&self) -> CodecStats {
        CodecStats {
            tx: lock(&self.packer).stats(),
            rx: lock(&self.unpacker).stats(),
        }
    }
}

/// Registered reassembly hooks; consulted on every call so they can be
/// replaced while the worker runs.
#[derive(Default)]
struct HookSlots {
    allocate: Slot<AllocateFn>,
    deliver: Slot<DeliverFn>,
    release: Slot<ReleaseFn>,
}

pub struct FragmentationStage {
    pub(crate) fragmenter: Mutex<Fragmenter>,
    pub(crate) worker: Mutex<Option<ReassemblyWorker>>,
    reassembly: ReassemblyConfig,
    counters: Arc<ReassemblyCounters>,
    hooks: HookSlots,
}

impl FragmentationStage {
    fn new(config: &FragmentationConfig) -> Self {
        FragmentationStage {
            fragmenter: Mutex::new(Fragmenter::new(config.fragment_size)),
            worker: Mutex::new(None),
            reassembly: config.reassembly(),
            counters: Arc::new(ReassemblyCounters::default()),
            hooks: HookSlots::default(),
        }
    }

    /// Worker hooks that defer to the registered ones, falling back to heap
    /// allocation and the channel's receive callback.
    fn worker_hooks(&self, kind: ChannelKind, receive: Slot<ReceiveFn>) -> ReassemblyHooks {
        let allocate = self.hooks.allocate.clone();
        let deliver = self.hooks.deliver.clone();
        let release = self.hooks.release.clone();

        ReassemblyHooks::new(move |frame: FrameBuffer| {
            let hook = lock(&deliver).clone();
            match hook {
                Some(f) => {
                    let mut f = lock(&f);
                    (&mut *f)(frame);
                }
                None => {
                    deliver_to(&receive, kind, frame.into_bytes());
                }
            }
        })
        .with_allocator(move |cap| {
            invoke(&allocate, |f| f(cap)).unwrap_or_else(|| Some(FrameBuffer::with_capacity(cap)))
        })
        .with_release(move |frame| {
            invoke(&release, |f| f(frame));
        })
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.counters.snapshot()
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub units_received: AtomicU64,
    pub frames_delivered: AtomicU64,
}

/// Point-in-time statistics for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: ChannelKind,
    pub state: ChannelState,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub units_received: u64,
    /// Payloads handed straight to the receive callback (no reassembly).
    pub frames_delivered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<CodecStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragmentation: Option<FragmentStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reassembly: Option<ReassemblyStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop: Option<DropStats>,
}

pub(crate) struct Channel {
    pub kind: ChannelKind,
    pub codec: CodecInfo,
    pub packing: Option<PackingStage>,
    pub fragmentation: Option<FragmentationStage>,
    pub transport: Option<Arc<dyn TransportSink>>,
    pub driver: Option<Arc<dyn TransportDriver>>,
    pub receive: Slot<ReceiveFn>,
    pub counters: ChannelCounters,
    pub next_frame: AtomicU32,
    /// Serializes start/stop of this channel.
    pub lifecycle: Mutex<()>,
}

impl Channel {
    pub fn new(
        kind: ChannelKind,
        config: &ChannelConfig,
        codec: CodecInfo,
        transport: Option<Arc<dyn TransportSink>>,
        driver: Option<Arc<dyn TransportDriver>>,
    ) -> Self {
        Channel {
            kind,
            codec,
            packing: config.packing.as_ref().map(PackingStage::new),
            fragmentation: config.fragmentation.as_ref().map(FragmentationStage::new),
            transport,
            driver,
            receive: Arc::new(Mutex::new(None)),
            counters: ChannelCounters::default(),
            next_frame: AtomicU32::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn next_frame_sequence(&self) -> u32 {
        self.next_frame.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn set_receive(&self, cb: ReceiveFn) {
        install(&self.receive, cb);
    }

    pub fn set_allocator(&self, f: AllocateFn) -> bool {
        self.fragmentation
            .as_ref()
            .map(|s| install(&s.hooks.allocate, f))
            .is_some()
    }

    pub fn set_deliverer(&self, f: DeliverFn) -> bool {
        self.fragmentation
            .as_ref()
            .map(|s| install(&s.hooks.deliver, f))
            .is_some()
    }

    pub fn set_releaser(&self, f: ReleaseFn) -> bool {
        self.fragmentation
            .as_ref()
            .map(|s| install(&s.hooks.release, f))
            .is_some()
    }

    /// Start the reassembly worker if this channel reassembles.
    pub fn start_reassembly(&self) -> std::io::Result<()> {
        let Some(stage) = &self.fragmentation else {
            return Ok(());
        };
        let mut slot = lock(&stage.worker);
        if slot.is_none() {
            let hooks = stage.worker_hooks(self.kind, self.receive.clone());
            *slot = Some(ReassemblyWorker::spawn_with_counters(
                self.kind.as_str(),
                &stage.reassembly,
                hooks,
                stage.counters.clone(),
            )?);
        }
        Ok(())
    }

    /// Stop and join the reassembly worker; the cache buffer goes to the
    /// release hook.
    pub fn stop_reassembly(&self) {
        if let Some(stage) = &self.fragmentation {
            let worker = lock(&stage.worker).take();
            if let Some(mut worker) = worker {
                worker.shutdown();
            }
        }
    }

    /// Drop any half-received unit.
    pub fn reset_receive(&self) {
        if let Some(stage) = &self.packing {
            lock(&stage.unpacker).reset();
        }
    }

    pub fn stats(&self, state: ChannelState, drop: Option<DropStats>) -> ChannelStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ChannelStats {
            channel: self.kind,
            state,
            frames_sent: load(&self.counters.frames_sent),
            frames_dropped: load(&self.counters.frames_dropped),
            bytes_sent: load(&self.counters.bytes_sent),
            send_errors: load(&self.counters.send_errors),
            units_received: load(&self.counters.units_received),
            frames_delivered: load(&self.counters.frames_delivered),
            codec: self.packing.as_ref().map(PackingStage::stats),
            fragmentation: self
                .fragmentation
                .as_ref()
                .map(|s| lock(&s.fragmenter).stats()),
            reassembly: self.fragmentation.as_ref().map(FragmentationStage::stats),
            drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_respect_stopped() {
        let states = ChannelStates::default();
        assert_eq!(states.get(ChannelKind::Video), ChannelState::Stopped);

        // Connected before Start is ignored.
        assert_eq!(
            states.set_if_started(ChannelKind::Video, ChannelState::Connected),
            ChannelState::Stopped
        );

        states.set(ChannelKind::Video, ChannelState::WaitingConnected);
        assert_eq!(
            states.set_if_started(ChannelKind::Video, ChannelState::Connected),
            ChannelState::Connected
        );
        assert_eq!(states.get(ChannelKind::Audio), ChannelState::Stopped);
    }

    #[test]
    fn channel_kind_display_and_index() {
        for (i, kind) in ChannelKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(ChannelKind::Video.to_string(), "video");
    }

    #[test]
    fn frame_sequence_starts_at_one() {
        let ch = Channel::new(
            ChannelKind::Control,
            &ChannelConfig::default(),
            CodecInfo::None,
            None,
            None,
        );
        assert_eq!(ch.next_frame_sequence(), 1);
        assert_eq!(ch.next_frame_sequence(), 2);
    }

    #[test]
    fn hooks_require_fragmentation_stage() {
        let plain = Channel::new(
            ChannelKind::Audio,
            &ChannelConfig {
                packing: None,
                fragmentation: None,
            },
            CodecInfo::Audio(AudioEncoding::G711a),
            None,
            None,
        );
        assert!(!plain.set_deliverer(Box::new(|_| {})));
        assert!(plain.packing.is_none());
        assert!(plain.fragmentation.is_none());
    }

    #[test]
    fn receive_callback_can_replace_itself() {
        let ch = Channel::new(
            ChannelKind::Control,
            &ChannelConfig::default(),
            CodecInfo::None,
            None,
            None,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (slot, log) = (ch.receive.clone(), seen.clone());
        ch.set_receive(Box::new(move |_, data| {
            log.lock().unwrap().push(format!("first:{}", data.len()));
            let log = log.clone();
            install(
                &slot,
                Box::new(move |_: ChannelKind, data: Bytes| {
                    log.lock().unwrap().push(format!("second:{}", data.len()))
                }) as ReceiveFn,
            );
        }));

        assert!(deliver_to(&ch.receive, ch.kind, Bytes::from_static(b"abc")));
        assert!(deliver_to(&ch.receive, ch.kind, Bytes::from_static(b"de")));
        assert_eq!(*seen.lock().unwrap(), vec!["first:3", "second:2"]);
    }

    #[test]
    fn deliver_without_callback_reports_unhandled() {
        let slot: Slot<ReceiveFn> = Arc::default();
        assert!(!deliver_to(&slot, ChannelKind::Audio, Bytes::new()));
        assert!(invoke(&slot, |_| ()).is_none());
    }

    #[test]
    fn codec_info_serializes_tagged() {
        let json = serde_json::to_value(CodecInfo::Video(VideoFormat::H264)).unwrap();
        assert_eq!(json["kind"], "video");
        assert_eq!(json["codec"], "h264");
    }
}
