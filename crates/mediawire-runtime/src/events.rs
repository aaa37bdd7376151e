//! # Lifecycle Events
//!
//! Channel state changes are posted from any thread and delivered in posting
//! order by one background thread to the registered lifecycle callback.
//!
//! Posting never blocks: the queue is bounded and a full queue drops the
//! event with a warning. The channel state itself is updated synchronously
//! at post time, so [`LifecycleNotifier::state`] is current even while the
//! queue is backed up.

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::channel::{install, invoke, ChannelKind, ChannelState, ChannelStates, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCode {
    Start,
    Connected,
    Disconnected,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub channel: ChannelKind,
    pub code: EventCode,
    /// Opaque value passed through from `start()` or the transport.
    pub param: u32,
}

pub type LifecycleFn = Box<dyn FnMut(&LifecycleEvent) + Send>;

type CallbackSlot = Slot<LifecycleFn>;

/// Cloneable handle for posting lifecycle events.
#[derive(Clone)]
pub struct LifecycleNotifier {
    tx: Sender<LifecycleEvent>,
    states: Arc<ChannelStates>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl LifecycleNotifier {
    /// Apply `code` to the channel state and queue the event.
    ///
    /// Returns false when the event was not queued: the queue is full, the
    /// dispatcher has shut down, or a transport event arrived for a stopped
    /// channel.
    pub fn post(&self, channel: ChannelKind, code: EventCode, param: u32) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(%channel, ?code, "lifecycle dispatcher closed, event discarded");
            return false;
        }
        match code {
            EventCode::Start => self.states.set(channel, ChannelState::WaitingConnected),
            EventCode::Stop => self.states.set(channel, ChannelState::Stopped),
            EventCode::Connected | EventCode::Disconnected => {
                let target = if code == EventCode::Connected {
                    ChannelState::Connected
                } else {
                    ChannelState::WaitingConnected
                };
                if self.states.set_if_started(channel, target) == ChannelState::Stopped {
                    debug!(%channel, ?code, "event for stopped channel ignored");
                    return false;
                }
            }
        }

        match self.tx.try_send(LifecycleEvent {
            channel,
            code,
            param,
        }) {
            Ok(()) => {
                trace!(%channel, ?code, param, "lifecycle event queued");
                true
            }
            Err(TrySendError::Full(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %ev.channel, code = ?ev.code, "lifecycle queue full, event dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn connected(&self, channel: ChannelKind, param: u32) -> bool {
        self.post(channel, EventCode::Connected, param)
    }

    pub fn disconnected(&self, channel: ChannelKind, param: u32) -> bool {
        self.post(channel, EventCode::Disconnected, param)
    }

    pub fn state(&self, channel: ChannelKind) -> ChannelState {
        self.states.get(channel)
    }

    /// Events lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the lifecycle thread.
pub(crate) struct EventDispatcher {
    notifier: LifecycleNotifier,
    callback: CallbackSlot,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn spawn(
        service: &str,
        capacity: usize,
        states: Arc<ChannelStates>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let callback: CallbackSlot = Arc::new(Mutex::new(None));

        let handle = {
            let callback = callback.clone();
            thread::Builder::new()
                .name(format!("mw-events-{service}"))
                .spawn(move || event_loop(rx, shutdown_rx, callback))?
        };
        info!(service, capacity, "lifecycle dispatcher started");

        Ok(EventDispatcher {
            notifier: LifecycleNotifier {
                tx,
                states,
                closed: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            callback,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn notifier(&self) -> &LifecycleNotifier {
        &self.notifier
    }

    pub fn set_callback(&self, cb: LifecycleFn) {
        install(&self.callback, cb);
    }

    /// Deliver what is queued, then stop and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.notifier.closed.store(true, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("lifecycle dispatcher panicked");
            }
            info!("lifecycle dispatcher stopped");
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(callback: &CallbackSlot, event: &LifecycleEvent) {
    if invoke(callback, |cb| cb(event)).is_none() {
        trace!(channel = %event.channel, code = ?event.code, "no lifecycle callback");
    }
}

fn event_loop(events: Receiver<LifecycleEvent>, shutdown: Receiver<()>, callback: CallbackSlot) {
    loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(event) => dispatch(&callback, &event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                while let Ok(event) = events.try_recv() {
                    dispatch(&callback, &event);
                }
                break;
            }
        }
    }
}
