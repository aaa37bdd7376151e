//! In-process transport that queues sent units for the same context to read
//! back. Used by the demo binary, the integration tests and the benches.
//!
//! Impairment is deterministic: with `with_loss_every(n)` every n-th unit is
//! accepted and silently discarded.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

use crate::channel::{ChannelKind, CodecInfo};
use crate::context::TransportContext;
use crate::error::TransferError;
use crate::events::LifecycleNotifier;
use crate::transport::{OccupancyProbe, TransportDriver, TransportSink};

pub struct LoopbackTransport {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    queued_bytes: AtomicUsize,
    sent_units: AtomicU64,
    lost_units: AtomicU64,
    loss_every: Option<u64>,
}

impl LoopbackTransport {
    /// `capacity` is the number of units the loopback holds before `send`
    /// reports `WouldBlock`.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        LoopbackTransport {
            tx,
            rx,
            queued_bytes: AtomicUsize::new(0),
            sent_units: AtomicU64::new(0),
            lost_units: AtomicU64::new(0),
            loss_every: None,
        }
    }

    pub fn with_loss_every(mut self, n: u64) -> Self {
        self.loss_every = (n > 0).then_some(n);
        self
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub fn queued_units(&self) -> usize {
        self.rx.len()
    }

    pub fn lost_units(&self) -> u64 {
        self.lost_units.load(Ordering::Relaxed)
    }

    /// Take one queued unit without delivering it.
    pub fn pop(&self) -> Option<Bytes> {
        let unit = self.rx.try_recv().ok()?;
        self.queued_bytes.fetch_sub(unit.len(), Ordering::AcqRel);
        Some(unit)
    }

    /// Feed every queued unit into `ctx.receive(channel, ..)`. Returns the
    /// number of units delivered.
    pub fn pump_into(&self, ctx: &TransportContext, channel: ChannelKind) -> Result<usize, TransferError> {
        let mut n = 0;
        while let Some(unit) = self.pop() {
            ctx.receive(channel, &unit)?;
            n += 1;
        }
        if n > 0 {
            trace!(%channel, units = n, "loopback pumped");
        }
        Ok(n)
    }
}

impl TransportSink for LoopbackTransport {
    fn send(&self, data: &[u8], _codec: CodecInfo) -> io::Result<usize> {
        let count = self.sent_units.fetch_add(1, Ordering::Relaxed) + 1;
        if self.loss_every.is_some_and(|n| count % n == 0) {
            self.lost_units.fetch_add(1, Ordering::Relaxed);
            debug!(unit = count, len = data.len(), "loopback dropped unit");
            return Ok(data.len());
        }
        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {
                self.queued_bytes.fetch_add(data.len(), Ordering::AcqRel);
                Ok(data.len())
            }
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Disconnected(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl OccupancyProbe for LoopbackTransport {
    fn unsent_bytes(&self) -> Option<usize> {
        Some(self.queued_bytes())
    }
}

/// Connects immediately on start.
impl TransportDriver for LoopbackTransport {
    fn start(&self, channel: ChannelKind, param: u32, notifier: &LifecycleNotifier) -> anyhow::Result<()> {
        notifier.connected(channel, param);
        Ok(())
    }

    fn stop(&self, _channel: ChannelKind) -> anyhow::Result<()> {
        Ok(())
    }
}
