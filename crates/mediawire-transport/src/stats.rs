//! # Transport Statistics
//!
//! Counters for every stage of the mediawire pipeline. Every silent drop
//! path has a counter here. Snapshots serialize to JSON for export.
//!
//! Single-threaded stages (packer, unpacker, fragmenter, drop gate) keep
//! plain `u64` fields. The reassembly stage is written by the ingesting
//! thread and the worker thread, so it uses [`ReassemblyCounters`] and is
//! read through [`ReassemblyCounters::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── Codec Stats ────────────────────────────────────────────────────────────

/// Packer-side statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackStats {
    /// Units successfully framed.
    pub units_packed: u64,
    /// Payload bytes framed (headers excluded).
    pub bytes_packed: u64,
    /// Payloads refused for exceeding the transmit capacity.
    pub oversized: u64,
}

/// Unpacker-side statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnpackStats {
    /// Units emitted to the caller (including CRC failures).
    pub units_unpacked: u64,
    /// Payload bytes emitted.
    pub bytes_unpacked: u64,
    /// Headers whose magic did not match.
    pub bad_magic: u64,
    /// Units whose CRC8 did not match the payload.
    pub crc_mismatches: u64,
    /// Headers declaring a payload larger than the receive capacity.
    pub oversized: u64,
    /// Times a cached partial unit was thrown away.
    pub partial_resets: u64,
}

/// Both directions of one channel's framing codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodecStats {
    pub tx: PackStats,
    pub rx: UnpackStats,
}

// ─── Fragmentation Stats ────────────────────────────────────────────────────

/// Send-side fragmentation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FragmentStats {
    /// Frames fully handed to the sink.
    pub frames: u64,
    /// Fragments accepted by the sink.
    pub fragments: u64,
    /// Frames abandoned because the sink refused a fragment.
    pub sink_failures: u64,
    /// Frames refused before splitting (empty or too many fragments).
    pub rejected: u64,
}

/// Receive-side reassembly counters, shared between the ingesting thread
/// and the reassembly worker.
#[derive(Debug, Default)]
pub struct ReassemblyCounters {
    pub ingested: AtomicU64,
    pub too_short: AtomicU64,
    pub oversized: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub malformed: AtomicU64,
    pub fragments_applied: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_abandoned: AtomicU64,
    pub stale: AtomicU64,
    pub out_of_order: AtomicU64,
    pub overflows: AtomicU64,
    pub alloc_failures: AtomicU64,
}

impl ReassemblyCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReassemblyStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReassemblyStats {
            ingested: load(&self.ingested),
            too_short: load(&self.too_short),
            oversized: load(&self.oversized),
            pool_exhausted: load(&self.pool_exhausted),
            malformed: load(&self.malformed),
            fragments_applied: load(&self.fragments_applied),
            frames_delivered: load(&self.frames_delivered),
            frames_abandoned: load(&self.frames_abandoned),
            stale: load(&self.stale),
            out_of_order: load(&self.out_of_order),
            overflows: load(&self.overflows),
            alloc_failures: load(&self.alloc_failures),
        }
    }
}

/// Point-in-time copy of [`ReassemblyCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    /// Fragments queued into the pool.
    pub ingested: u64,
    /// Inputs no longer than a fragment header.
    pub too_short: u64,
    /// Inputs larger than a pool slot.
    pub oversized: u64,
    /// Inputs dropped because every slot was busy.
    pub pool_exhausted: u64,
    /// Slots whose contents could not be parsed as a fragment.
    pub malformed: u64,
    /// Fragments copied into the frame in progress.
    pub fragments_applied: u64,
    /// Complete frames handed to the deliver hook.
    pub frames_delivered: u64,
    /// Incomplete frames discarded by a new index-1 fragment.
    pub frames_abandoned: u64,
    /// Fragments belonging to a frame other than the one in progress.
    pub stale: u64,
    /// Fragments skipped for arriving out of index order.
    pub out_of_order: u64,
    /// Frames aborted for exceeding the buffer capacity.
    pub overflows: u64,
    /// Allocator hook failures.
    pub alloc_failures: u64,
}

impl ReassemblyStats {
    /// Fraction of ingested fragments that ended up in a frame.
    pub fn apply_ratio(&self) -> f64 {
        if self.ingested == 0 {
            0.0
        } else {
            self.fragments_applied as f64 / self.ingested as f64
        }
    }
}

// ─── Drop Stats ─────────────────────────────────────────────────────────────

/// Video drop-gate statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropStats {
    /// Frames presented to the gate.
    pub frames_checked: u64,
    /// Frames the gate refused.
    pub frames_dropped: u64,
    /// I-frames among the dropped.
    pub i_frames_dropped: u64,
    /// Times the occupancy probe failed.
    pub probe_failures: u64,
    /// Drop level after the last decision.
    pub level: u32,
    /// Highest level reached so far.
    pub peak_level: u32,
}

impl DropStats {
    pub fn drop_rate(&self) -> f64 {
        if self.frames_checked == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_checked as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembly_snapshot_reflects_bumps() {
        let counters = ReassemblyCounters::default();
        ReassemblyCounters::bump(&counters.ingested);
        ReassemblyCounters::bump(&counters.ingested);
        ReassemblyCounters::bump(&counters.fragments_applied);
        let snap = counters.snapshot();
        assert_eq!(snap.ingested, 2);
        assert_eq!(snap.fragments_applied, 1);
        assert!((snap.apply_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_ratios_are_zero() {
        assert_eq!(ReassemblyStats::default().apply_ratio(), 0.0);
        assert_eq!(DropStats::default().drop_rate(), 0.0);
    }

    #[test]
    fn stats_serialize_to_json() {
        let stats = CodecStats {
            tx: PackStats {
                units_packed: 3,
                ..Default::default()
            },
            rx: UnpackStats {
                crc_mismatches: 1,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["tx"]["units_packed"], 3);
        assert_eq!(json["rx"]["crc_mismatches"], 1);
    }
}
