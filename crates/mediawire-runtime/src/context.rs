//! # Transport Context
//!
//! One context owns the three channels, the video drop policy and the
//! lifecycle dispatcher. It is built once from a [`ContextConfig`] and torn
//! down by [`TransportContext::shutdown`] or `Drop`.
//!
//! ## Send path
//!
//! ```text
//! frame ─▶ drop gate (video) ─▶ fragmenter ─▶ packer ─▶ TransportSink
//! ```
//!
//! ## Receive path
//!
//! ```text
//! bytes ─▶ unpacker ─▶ reassembly worker ─▶ deliver hook / receive callback
//! ```
//!
//! Each stage runs only if configured for the channel; absent stages are
//! skipped.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

use mediawire_transport::congestion::{Verdict, VideoDropPolicy};
use mediawire_transport::fragment::FragmentError;
use mediawire_transport::media::{classify_h264, FrameKind, VideoFormat};
use mediawire_transport::reassembly::{FrameBuffer, ReassemblyWorker};

use crate::channel::{
    deliver_to, lock, Channel, ChannelKind, ChannelState, ChannelStates, ChannelStats, CodecInfo,
    FragmentationStage, OutgoingFrame, SendOutcome,
};
use crate::config::ContextConfig;
use crate::error::TransferError;
use crate::events::{EventCode, EventDispatcher, LifecycleEvent, LifecycleNotifier};
use crate::transport::{OccupancyProbe, TransportDriver, TransportSink};

// ─── Builder ────────────────────────────────────────────────────────────────

pub struct TransportContextBuilder {
    config: ContextConfig,
    transports: [Option<Arc<dyn TransportSink>>; 3],
    drivers: [Option<Arc<dyn TransportDriver>>; 3],
    probe: Option<Arc<dyn OccupancyProbe>>,
}

impl TransportContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        TransportContextBuilder {
            config,
            transports: [None, None, None],
            drivers: [None, None, None],
            probe: None,
        }
    }

    /// A channel without a transport cannot be started or sent on.
    pub fn transport(mut self, kind: ChannelKind, sink: Arc<dyn TransportSink>) -> Self {
        self.transports[kind.index()] = Some(sink);
        self
    }

    pub fn driver(mut self, kind: ChannelKind, driver: Arc<dyn TransportDriver>) -> Self {
        self.drivers[kind.index()] = Some(driver);
        self
    }

    /// Enables the video drop gate.
    pub fn occupancy_probe(mut self, probe: Arc<dyn OccupancyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<TransportContext, TransferError> {
        let config = self.config;
        config.validate().map_err(TransferError::InvalidConfig)?;

        let states = Arc::new(ChannelStates::default());
        let events = EventDispatcher::spawn(
            &config.service_name,
            config.event_queue_capacity,
            states.clone(),
        )
        .map_err(|source| TransferError::WorkerSpawn {
            name: format!("mw-events-{}", config.service_name),
            source,
        })?;
        let notifier = events.notifier().clone();

        let [control_tx, video_tx, audio_tx] = self.transports;
        let [control_drv, video_drv, audio_drv] = self.drivers;
        let channels = [
            Channel::new(
                ChannelKind::Control,
                &config.control,
                CodecInfo::None,
                control_tx,
                control_drv,
            ),
            Channel::new(
                ChannelKind::Video,
                &config.video,
                CodecInfo::Video(config.video_format),
                video_tx,
                video_drv,
            ),
            Channel::new(
                ChannelKind::Audio,
                &config.audio,
                CodecInfo::Audio(config.audio_encoding),
                audio_tx,
                audio_drv,
            ),
        ];

        info!(
            service = %config.service_name,
            video_format = ?config.video_format,
            drop_gate = self.probe.is_some(),
            "transport context built"
        );

        Ok(TransportContext {
            service_name: config.service_name,
            channels,
            states,
            video_format: config.video_format,
            video_drop: Mutex::new(VideoDropPolicy::new(config.video_drop)),
            probe: self.probe,
            notifier,
            events: Mutex::new(events),
            shut_down: AtomicBool::new(false),
        })
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Snapshot of every channel, for export.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub service_name: String,
    pub lifecycle_events_dropped: u64,
    pub channels: Vec<ChannelStats>,
}

pub struct TransportContext {
    service_name: String,
    channels: [Channel; 3],
    states: Arc<ChannelStates>,
    video_format: VideoFormat,
    video_drop: Mutex<VideoDropPolicy>,
    probe: Option<Arc<dyn OccupancyProbe>>,
    notifier: LifecycleNotifier,
    events: Mutex<EventDispatcher>,
    shut_down: AtomicBool,
}

impl TransportContext {
    pub fn builder(config: ContextConfig) -> TransportContextBuilder {
        TransportContextBuilder::new(config)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn channel(&self, kind: ChannelKind) -> &Channel {
        &self.channels[kind.index()]
    }

    pub fn state(&self, kind: ChannelKind) -> ChannelState {
        self.states.get(kind)
    }

    /// Handle the transport uses to report connection changes.
    pub fn notifier(&self) -> LifecycleNotifier {
        self.notifier.clone()
    }

    // ── Registration ──

    /// Called with every payload that reaches the end of the receive path,
    /// on the receiving thread or, for reassembled frames, the reassembly
    /// worker. It may register a replacement for itself, which serves the
    /// next payload, but must not call back into `receive` for the same
    /// channel.
    pub fn register_receive_callback(
        &self,
        kind: ChannelKind,
        cb: impl FnMut(ChannelKind, Bytes) + Send + 'static,
    ) {
        self.channel(kind).set_receive(Box::new(cb));
    }

    pub fn register_lifecycle_callback(&self, cb: impl FnMut(&LifecycleEvent) + Send + 'static) {
        lock(&self.events).set_callback(Box::new(cb));
    }

    pub fn register_reassembly_allocator(
        &self,
        kind: ChannelKind,
        f: impl FnMut(usize) -> Option<FrameBuffer> + Send + 'static,
    ) -> Result<(), TransferError> {
        self.channel(kind)
            .set_allocator(Box::new(f))
            .then_some(())
            .ok_or_else(|| no_reassembly(kind))
    }

    /// Replaces the default hand-off to the receive callback.
    pub fn register_reassembly_deliverer(
        &self,
        kind: ChannelKind,
        f: impl FnMut(FrameBuffer) + Send + 'static,
    ) -> Result<(), TransferError> {
        self.channel(kind)
            .set_deliverer(Box::new(f))
            .then_some(())
            .ok_or_else(|| no_reassembly(kind))
    }

    /// Receives the cache buffer when the channel stops.
    pub fn register_reassembly_freer(
        &self,
        kind: ChannelKind,
        f: impl FnMut(FrameBuffer) + Send + 'static,
    ) -> Result<(), TransferError> {
        self.channel(kind)
            .set_releaser(Box::new(f))
            .then_some(())
            .ok_or_else(|| no_reassembly(kind))
    }

    // ── Lifecycle ──

    /// Start a channel: spawn its reassembly worker, post `Start`, then start
    /// the transport driver. A driver failure rolls the channel back.
    pub fn start(&self, kind: ChannelKind, param: u32) -> Result<(), TransferError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransferError::ShutDown);
        }
        let ch = self.channel(kind);
        if ch.transport.is_none() {
            return Err(TransferError::NotConfigured(kind));
        }
        let _guard = lock(&ch.lifecycle);
        if self.states.get(kind) != ChannelState::Stopped {
            return Err(TransferError::AlreadyStarted(kind));
        }

        ch.start_reassembly()
            .map_err(|source| TransferError::WorkerSpawn {
                name: format!("mw-reasm-{kind}"),
                source,
            })?;
        self.notifier.post(kind, EventCode::Start, param);

        if let Some(driver) = &ch.driver {
            if let Err(e) = driver.start(kind, param, &self.notifier) {
                warn!(channel = %kind, error = %e, "transport driver failed to start");
                ch.stop_reassembly();
                self.notifier.post(kind, EventCode::Stop, param);
                self.states.set(kind, ChannelState::Stopped);
                return Err(TransferError::Driver(e));
            }
        }
        info!(channel = %kind, param, "channel started");
        Ok(())
    }

    /// Stop a channel: stop the driver, join the reassembly worker, post
    /// `Stop` and discard any half-received unit.
    pub fn stop(&self, kind: ChannelKind) -> Result<(), TransferError> {
        let ch = self.channel(kind);
        let _guard = lock(&ch.lifecycle);
        if self.states.get(kind) == ChannelState::Stopped {
            return Err(TransferError::NotStarted(kind));
        }

        if let Some(driver) = &ch.driver {
            if let Err(e) = driver.stop(kind) {
                warn!(channel = %kind, error = %e, "transport driver failed to stop");
            }
        }
        ch.stop_reassembly();
        self.notifier.post(kind, EventCode::Stop, 0);
        // The notifier does not touch state once the dispatcher is closed.
        self.states.set(kind, ChannelState::Stopped);
        ch.reset_receive();
        info!(channel = %kind, "channel stopped");
        Ok(())
    }

    /// Stop every started channel and the lifecycle thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for kind in ChannelKind::ALL {
            if self.states.get(kind) == ChannelState::Stopped {
                continue;
            }
            match self.stop(kind) {
                Ok(()) => {}
                // Stopped by another thread since the state check.
                Err(TransferError::NotStarted(_)) => {
                    debug!(channel = %kind, "channel already stopped during shutdown");
                }
                Err(e) => warn!(channel = %kind, error = %e, "channel stop failed during shutdown"),
            }
        }
        lock(&self.events).shutdown();
        info!(service = %self.service_name, "transport context shut down");
    }

    // ── Data path ──

    /// Send one application frame on `kind`.
    ///
    /// With fragmentation, `Sent` means every fragment was accepted by the
    /// transport; a failure part-way abandons the rest of the frame.
    pub fn send(&self, kind: ChannelKind, frame: OutgoingFrame) -> Result<SendOutcome, TransferError> {
        let ch = self.channel(kind);
        let Some(transport) = ch.transport.as_deref() else {
            return Err(TransferError::NotConfigured(kind));
        };
        if self.states.get(kind) == ChannelState::Stopped {
            return Err(TransferError::NotStarted(kind));
        }
        if frame.data.is_empty() {
            return Err(TransferError::EmptyPayload);
        }

        if kind == ChannelKind::Video && self.drop_gate(&frame) == Verdict::Drop {
            ch.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(SendOutcome::Dropped);
        }

        let result = match &ch.fragmentation {
            Some(stage) => {
                let sequence = frame.sequence.unwrap_or_else(|| ch.next_frame_sequence());
                send_fragmented(ch, stage, transport, sequence, &frame.data)
            }
            None => send_whole(ch, transport, &frame.data),
        };

        match result {
            Ok((units, bytes)) => {
                ch.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                ch.counters.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                trace!(channel = %kind, len = frame.data.len(), units, bytes, "frame sent");
                Ok(SendOutcome::Sent { units, bytes })
            }
            Err(e) => {
                ch.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %kind, len = frame.data.len(), error = %e, "send failed");
                Err(e)
            }
        }
    }

    fn drop_gate(&self, frame: &OutgoingFrame) -> Verdict {
        let Some(probe) = &self.probe else {
            return Verdict::Send;
        };
        let kind = match frame.kind {
            FrameKind::Unknown if self.video_format == VideoFormat::H264 => {
                classify_h264(&frame.data)
            }
            k => k,
        };
        let occupancy = probe.unsent_bytes();
        lock(&self.video_drop).check(self.video_format, kind, frame.data.len(), occupancy)
    }

    /// Feed bytes read from the transport into `kind`'s receive path.
    ///
    /// Malformed input is logged and counted, never returned as an error.
    /// Only a channel with reassembly but no unpacker reports ingest
    /// refusals, since there the caller's bytes are exactly one fragment.
    pub fn receive(&self, kind: ChannelKind, data: &[u8]) -> Result<(), TransferError> {
        let ch = self.channel(kind);
        if self.states.get(kind) == ChannelState::Stopped {
            return Err(TransferError::NotStarted(kind));
        }
        if data.is_empty() {
            return Ok(());
        }

        match (&ch.packing, &ch.fragmentation) {
            (Some(packing), fragmentation) => {
                let worker = fragmentation.as_ref().map(|s| lock(&s.worker));
                let mut unpacker = lock(&packing.unpacker);
                unpacker.unpack(data, |unit| {
                    ch.counters.units_received.fetch_add(1, Ordering::Relaxed);
                    match &worker {
                        Some(slot) => ingest_unit(kind, slot.as_ref(), &unit.payload),
                        None => deliver_direct(ch, unit.payload),
                    }
                });
            }
            (None, Some(stage)) => {
                ch.counters.units_received.fetch_add(1, Ordering::Relaxed);
                let worker = lock(&stage.worker);
                let worker = worker.as_ref().ok_or(TransferError::NotStarted(kind))?;
                worker.ingest(data)?;
            }
            (None, None) => {
                ch.counters.units_received.fetch_add(1, Ordering::Relaxed);
                deliver_direct(ch, Bytes::copy_from_slice(data));
            }
        }
        Ok(())
    }

    // ── Stats ──

    pub fn stats(&self, kind: ChannelKind) -> ChannelStats {
        let drop = (kind == ChannelKind::Video).then(|| lock(&self.video_drop).stats());
        self.channel(kind).stats(self.states.get(kind), drop)
    }

    pub fn snapshot(&self) -> ContextStats {
        ContextStats {
            service_name: self.service_name.clone(),
            lifecycle_events_dropped: self.notifier.dropped(),
            channels: ChannelKind::ALL.iter().map(|k| self.stats(*k)).collect(),
        }
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn no_reassembly(kind: ChannelKind) -> TransferError {
    TransferError::InvalidConfig(format!("{kind} channel has no reassembly stage"))
}

fn deliver_direct(ch: &Channel, payload: Bytes) {
    if deliver_to(&ch.receive, ch.kind, payload) {
        ch.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
    } else {
        trace!(channel = %ch.kind, "no receive callback, payload discarded");
    }
}

fn ingest_unit(kind: ChannelKind, worker: Option<&ReassemblyWorker>, payload: &[u8]) {
    let Some(worker) = worker else {
        debug!(channel = %kind, "reassembly not running, unit discarded");
        return;
    };
    if let Err(e) = worker.ingest(payload) {
        debug!(channel = %kind, len = payload.len(), error = %e, "fragment refused");
    }
}

/// Pack (if configured) and send a frame as one unit.
fn send_whole(
    ch: &Channel,
    transport: &dyn TransportSink,
    data: &[u8],
) -> Result<(usize, usize), TransferError> {
    let bytes = match &ch.packing {
        Some(packing) => {
            let mut packer = lock(&packing.packer);
            let unit = packer.pack(data)?;
            transport.send(unit, ch.codec)?
        }
        None => transport.send(data, ch.codec)?,
    };
    Ok((1, bytes))
}

/// Fragment a frame, packing each fragment (if configured) before sending.
fn send_fragmented(
    ch: &Channel,
    stage: &FragmentationStage,
    transport: &dyn TransportSink,
    sequence: u32,
    data: &[u8],
) -> Result<(usize, usize), TransferError> {
    let mut fragmenter = lock(&stage.fragmenter);
    let max = fragmenter.max_frame_len();
    let mut packer = ch.packing.as_ref().map(|p| lock(&p.packer));
    let mut bytes = 0;

    let units = fragmenter
        .fragment(sequence, data, |fragment| {
            bytes += match packer.as_mut() {
                Some(packer) => {
                    let unit = packer.pack(fragment)?;
                    transport.send(unit, ch.codec)?
                }
                None => transport.send(fragment, ch.codec)?,
            };
            Ok::<_, TransferError>(())
        })
        .map_err(|e| match e {
            FragmentError::Empty => TransferError::EmptyPayload,
            FragmentError::TooManyFragments { .. } => TransferError::PayloadTooLarge {
                len: data.len(),
                max,
            },
            FragmentError::Rejected { index, source } => TransferError::FragmentRejected {
                index,
                source: Box::new(source),
            },
        })?;
    Ok((units, bytes))
}
