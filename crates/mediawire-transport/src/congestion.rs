//! # Video Frame-Drop Control
//!
//! Protects a live H.264 stream from a congested transport by dropping whole
//! frames instead of letting the send buffer grow.
//!
//! ## Drop Levels
//!
//! ```text
//!   occupancy + frame ──▶ projected
//!
//!   projected <= threshold            level 0      send everything
//!   threshold + k*interval ..         level k+1    P-frames past
//!                                                   (max_level - level)
//!                                                   in the GOP are dropped
//!   level max_level-1 (saturated)                  the last budgeted
//!                                                   I-frame is dropped too
//! ```
//!
//! `threshold = budget / 2`, `interval = threshold / 7`.
//!
//! Escalation is immediate. De-escalation only happens from the average of
//! occupancy samples collected over a sampling window that has been open for
//! at least `min_sampling`; windows older than `max_sampling` are discarded.
//!
//! ## GOP Gate
//!
//! [`VideoDropPolicy`] wraps the controller: once a frame of a GOP is dropped
//! every later frame of that GOP is dropped too, since P-frames are useless
//! without their references. The next I-frame reopens the gate.

use std::time::Duration;
use quanta::Instant;
use tracing::{debug, info, trace};

use crate::media::{FrameKind, VideoFormat};
use crate::stats::DropStats;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Number of level steps between the start threshold and the full budget.
const LEVEL_STEPS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropConfig {
    /// Transport send-buffer budget in bytes.
    pub buffer_budget: usize,
    /// Number of drop levels, including level 0.
    pub max_level: u32,
    /// I-frames per GOP cycle; the last one may be dropped at saturation.
    pub gop_i_frame_budget: u32,
    /// Minimum age of a sampling window before it can lower the level.
    pub min_sampling: Duration,
    /// Windows older than this are discarded unevaluated.
    pub max_sampling: Duration,
}

impl Default for DropConfig {
    fn default() -> Self {
        Self {
            buffer_budget: 200 * 1024,
            max_level: 8,
            gop_i_frame_budget: 2,
            min_sampling: Duration::from_secs(1),
            max_sampling: Duration::from_secs(5),
        }
    }
}

// ─── Drop Controller ────────────────────────────────────────────────────────

/// Drop-level state machine for one video stream.
pub struct DropController {
    config: DropConfig,
    start_threshold: usize,
    level_interval: usize,

    level: u32,
    i_count: u32,
    p_count: u32,
    i_frame_dropped: bool,

    window_start: Option<Instant>,
    sample_total: u64,
    sample_count: u32,
}

impl DropController {
    pub fn new(config: DropConfig) -> Self {
        let start_threshold = config.buffer_budget / 2;
        let level_interval = (start_threshold / LEVEL_STEPS).max(1);
        let config = DropConfig {
            max_level: config.max_level.max(2),
            gop_i_frame_budget: config.gop_i_frame_budget.max(1),
            ..config
        };
        DropController {
            config,
            start_threshold,
            level_interval,
            level: 0,
            i_count: 0,
            p_count: 0,
            i_frame_dropped: false,
            window_start: None,
            sample_total: 0,
            sample_count: 0,
        }
    }

    pub fn config(&self) -> &DropConfig {
        &self.config
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn start_threshold(&self) -> usize {
        self.start_threshold
    }

    pub fn level_interval(&self) -> usize {
        self.level_interval
    }

    pub fn i_frame_dropped(&self) -> bool {
        self.i_frame_dropped
    }

    /// I-frames seen in the current budget cycle.
    pub fn i_count(&self) -> u32 {
        self.i_count
    }

    /// P-frames since the last I-frame.
    pub fn p_count(&self) -> u32 {
        self.p_count
    }

    /// Count a frame into the GOP structure.
    pub fn record_frame(&mut self, is_intra: bool) {
        if is_intra {
            if self.i_count >= self.config.gop_i_frame_budget {
                self.i_count = 0;
            }
            self.i_count += 1;
            self.p_count = 0;
        } else {
            self.p_count = self.p_count.saturating_add(1);
        }
    }

    /// Update the level from one occupancy sample and decide whether the
    /// frame should be dropped.
    pub fn should_drop(
        &mut self,
        now: Instant,
        frame_len: usize,
        occupancy: usize,
        is_intra: bool,
    ) -> bool {
        let projected = frame_len.saturating_add(occupancy);
        let over = projected > self.start_threshold;
        if self.level == 0 && !over {
            return false;
        }

        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) > self.config.max_sampling {
                trace!(samples = self.sample_count, "sampling window expired");
                self.reset_window();
            }
        }
        if self.window_start.is_some() {
            self.sample_total += occupancy as u64;
            self.sample_count += 1;
        }

        let before = self.level;
        if over {
            let instant = self.level_for(projected);
            if self.level > instant {
                self.recover(now, instant, false);
            } else {
                self.level = instant;
            }
        } else {
            self.recover(now, self.level, true);
        }
        if self.level > 0 && self.window_start.is_none() {
            self.window_start = Some(now);
        }
        if self.level != before {
            debug!(from = before, to = self.level, projected, occupancy, "drop level changed");
        }

        if self.level == 0 {
            self.i_frame_dropped = false;
            return false;
        }

        if is_intra {
            if self.level >= self.config.max_level - 1
                && self.i_count == self.config.gop_i_frame_budget
            {
                self.i_frame_dropped = true;
                return true;
            }
            self.i_frame_dropped = false;
            false
        } else {
            self.p_count >= self.config.max_level - self.level
        }
    }

    fn level_for(&self, size: usize) -> u32 {
        if size <= self.start_threshold {
            return 0;
        }
        let steps = (size - self.start_threshold) / self.level_interval + 1;
        steps.min((self.config.max_level - 1) as usize) as u32
    }

    fn recover(&mut self, now: Instant, instant_level: u32, recovery: bool) {
        let Some(start) = self.window_start else {
            return;
        };
        if now.saturating_duration_since(start) < self.config.min_sampling || self.sample_count == 0 {
            return;
        }

        let average = (self.sample_total / self.sample_count as u64) as usize;
        if average < self.start_threshold {
            self.level = if recovery { 0 } else { instant_level };
        } else {
            self.level = self.level_for(average).max(instant_level);
        }
        trace!(average, samples = self.sample_count, level = self.level, "sampling window evaluated");
        self.reset_window();
    }

    fn reset_window(&mut self) {
        self.window_start = None;
        self.sample_total = 0;
        self.sample_count = 0;
    }
}

// ─── GOP Gate ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Send,
    Drop,
}

/// Per-context video drop policy.
pub struct VideoDropPolicy {
    controller: DropController,
    gop_drop: bool,
    stats: DropStats,
}

impl VideoDropPolicy {
    pub fn new(config: DropConfig) -> Self {
        VideoDropPolicy {
            controller: DropController::new(config),
            gop_drop: false,
            stats: DropStats::default(),
        }
    }

    pub fn controller(&self) -> &DropController {
        &self.controller
    }

    /// True while the rest of the current GOP is being dropped.
    pub fn gop_dropping(&self) -> bool {
        self.gop_drop
    }

    /// Decide the fate of one outgoing video frame.
    ///
    /// `occupancy` is the transport's unsent byte count, `None` when it
    /// could not be read.
    pub fn check(
        &mut self,
        format: VideoFormat,
        kind: FrameKind,
        frame_len: usize,
        occupancy: Option<usize>,
    ) -> Verdict {
        self.check_at(Instant::now(), format, kind, frame_len, occupancy)
    }

    pub fn check_at(
        &mut self,
        now: Instant,
        format: VideoFormat,
        kind: FrameKind,
        frame_len: usize,
        occupancy: Option<usize>,
    ) -> Verdict {
        if format != VideoFormat::H264 {
            return Verdict::Send;
        }
        self.stats.frames_checked += 1;

        let is_intra = kind.is_intra();
        if is_intra {
            self.gop_drop = false;
        }
        self.controller.record_frame(is_intra);

        let Some(occupancy) = occupancy else {
            self.stats.probe_failures += 1;
            self.gop_drop = false;
            return Verdict::Send;
        };

        if !self.controller.i_frame_dropped()
            && self.gop_drop
            && occupancy < self.controller.start_threshold() / 2
        {
            info!(occupancy, "buffer drained, resuming GOP");
            self.gop_drop = false;
        }

        let drop = if self.gop_drop {
            true
        } else {
            let drop = self
                .controller
                .should_drop(now, frame_len, occupancy, is_intra);
            self.gop_drop = drop;
            drop
        };

        let level = self.controller.level();
        self.stats.level = level;
        self.stats.peak_level = self.stats.peak_level.max(level);
        if drop {
            self.stats.frames_dropped += 1;
            if is_intra {
                self.stats.i_frames_dropped += 1;
            }
            debug!(frame_len, occupancy, level, intra = is_intra, "video frame dropped");
            Verdict::Drop
        } else {
            Verdict::Send
        }
    }

    pub fn stats(&self) -> DropStats {
        self.stats.clone()
    }
}
