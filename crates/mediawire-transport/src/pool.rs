//! # Fragment Slot Pool
//!
//! Fixed arena of equally sized byte slots that hands received fragments from
//! the ingesting thread to the reassembly worker without per-fragment
//! allocation.
//!
//! Slots are addressed by index. At every instant each index sits in exactly
//! one place: the free list, the ready list, or the hands of whoever popped
//! it. Both lists are bounded crossbeam channels sized to the arena, so
//! pushing an index back can never block.
//!
//! 64 slots of 1.2 KB cover a burst of ~75 KB, about one 720p I-frame.

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::Duration;

/// Why a push did not queue anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("input of {len} bytes exceeds slot size {slot_size}")]
    Oversized { len: usize, slot_size: usize },
    #[error("no free slot")]
    Exhausted,
}

/// Outcome of waiting on the ready list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Slot(usize),
    /// [`SlotPool::wake`] was called.
    Woken,
    TimedOut,
}

pub struct SlotPool {
    slots: Box<[Mutex<Vec<u8>>]>,
    slot_size: usize,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    ready_tx: Sender<usize>,
    ready_rx: Receiver<usize>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl SlotPool {
    /// Allocate `slot_count` slots of `slot_size` bytes, all free.
    pub fn new(slot_count: usize, slot_size: usize) -> Self {
        let slot_count = slot_count.max(1);
        let (free_tx, free_rx) = bounded(slot_count);
        let (ready_tx, ready_rx) = bounded(slot_count);
        let (wake_tx, wake_rx) = bounded(1);

        let slots = (0..slot_count)
            .map(|_| Mutex::new(Vec::with_capacity(slot_size)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        for idx in 0..slot_count {
            // Capacity equals slot_count, so this never fails.
            let _ = free_tx.try_send(idx);
        }

        SlotPool {
            slots,
            slot_size,
            free_tx,
            free_rx,
            ready_tx,
            ready_rx,
            wake_tx,
            wake_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots currently on the free list.
    pub fn free_len(&self) -> usize {
        self.free_rx.len()
    }

    /// Slots waiting for the worker.
    pub fn ready_len(&self) -> usize {
        self.ready_rx.len()
    }

    /// Copy `data` into a free slot and queue it for the worker. Never blocks.
    pub fn try_push(&self, data: &[u8]) -> Result<(), PushError> {
        if data.len() > self.slot_size {
            return Err(PushError::Oversized {
                len: data.len(),
                slot_size: self.slot_size,
            });
        }
        let idx = match self.free_rx.try_recv() {
            Ok(idx) => idx,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                return Err(PushError::Exhausted)
            }
        };
        {
            let mut slot = self.slots[idx].lock().unwrap_or_else(|e| e.into_inner());
            slot.clear();
            slot.extend_from_slice(data);
        }
        let _ = self.ready_tx.try_send(idx);
        Ok(())
    }

    /// Block until a slot is ready, [`wake`](Self::wake) is called, or
    /// `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Ready {
        select! {
            recv(self.ready_rx) -> idx => match idx {
                Ok(idx) => Ready::Slot(idx),
                Err(_) => Ready::Woken,
            },
            recv(self.wake_rx) -> _ => Ready::Woken,
            default(timeout) => Ready::TimedOut,
        }
    }

    /// Pop a ready slot without waiting.
    pub fn try_ready(&self) -> Option<usize> {
        self.ready_rx.try_recv().ok()
    }

    /// Run `f` over the contents of a slot the caller has popped.
    pub fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let slot = self.slots[idx].lock().unwrap_or_else(|e| e.into_inner());
        f(&slot)
    }

    /// Return a popped slot to the free list.
    pub fn release(&self, idx: usize) {
        let _ = self.free_tx.try_send(idx);
    }

    /// Interrupt a pending [`wait_ready`](Self::wait_ready).
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}
