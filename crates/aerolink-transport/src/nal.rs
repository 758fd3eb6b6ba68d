//! # H.264 Frame Tracker
//!
//! Scans the raw Annex-B elementary stream as it is fed to the scheduler,
//! counts frames and keyframes, and applies keyframe-interval changes at a
//! point in the GOP where the encoder can switch without a visible stall.
//!
//! Start codes are `00 00 01` or `00 00 00 01` and may straddle feed calls.

use std::time::Duration;

use quanta::Instant;

use crate::stats::{Ewma, FrameStats};
use crate::wire::KeyframeCommand;

pub const MIN_KEYFRAME_INTERVAL: u32 = 2;
pub const MAX_KEYFRAME_INTERVAL: u32 = 1000;

/// Classification of an H.264 NAL unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    /// SPS, PPS or SPS extension.
    ParameterSet,
    /// IDR slice.
    Keyframe,
    /// Non-IDR slice.
    Slice,
    Other,
}

/// Classify the first byte of an H.264 NAL unit.
pub fn classify_h264(header: u8) -> NalClass {
    match header & 0x1F {
        5 => NalClass::Keyframe,
        1 => NalClass::Slice,
        7 | 8 | 13 => NalClass::ParameterSet,
        _ => NalClass::Other,
    }
}

// ─── Frame Tracker ──────────────────────────────────────────────────────────

pub struct FrameTracker {
    slices_per_frame: u32,
    zeros: u8,
    expect_header: bool,
    slices_in_frame: u32,
    frame_is_key: bool,
    frame_bytes: u64,

    seen_keyframe: bool,
    frames_since_keyframe: u32,
    /// Active interval in frames, 0 until known.
    interval: u32,
    pending: Option<u32>,

    last_frame_at: Option<Instant>,
    frame_interval: Ewma,
    stats: FrameStats,
}

impl FrameTracker {
    /// `interval` is the configured keyframe interval, 0 to learn it from
    /// the stream.
    pub fn new(slices_per_frame: u32, interval: u32) -> Self {
        let slices_per_frame = slices_per_frame.max(1);
        FrameTracker {
            slices_per_frame,
            zeros: 0,
            expect_header: false,
            slices_in_frame: 0,
            frame_is_key: false,
            frame_bytes: 0,
            seen_keyframe: false,
            frames_since_keyframe: 0,
            interval: if interval == 0 {
                0
            } else {
                interval.clamp(MIN_KEYFRAME_INTERVAL, MAX_KEYFRAME_INTERVAL)
            },
            pending: None,
            last_frame_at: None,
            frame_interval: Ewma::new(0.125),
            stats: FrameStats {
                slices_per_frame,
                ..Default::default()
            },
        }
    }

    /// Active keyframe interval in frames, 0 when unknown.
    pub fn keyframe_interval(&self) -> u32 {
        self.interval
    }

    pub fn pending_interval(&self) -> Option<u32> {
        self.pending
    }

    pub fn frames_since_keyframe(&self) -> u32 {
        self.frames_since_keyframe
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Request a new keyframe interval. Takes effect at a later frame
    /// boundary; returns the clamped value.
    pub fn set_keyframe_interval(&mut self, frames: u32) -> u32 {
        let frames = frames.clamp(MIN_KEYFRAME_INTERVAL, MAX_KEYFRAME_INTERVAL);
        self.pending = (frames != self.interval).then_some(frames);
        frames
    }

    /// Scan a chunk of stream input. Returns a command when a pending
    /// keyframe interval took effect.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Option<KeyframeCommand> {
        let mut command = None;
        for &b in data {
            self.frame_bytes += 1;
            if self.expect_header {
                self.expect_header = false;
                if let Some(c) = self.on_nal(classify_h264(b), now) {
                    command = Some(c);
                }
            }
            match b {
                0 => self.zeros = self.zeros.saturating_add(1),
                1 if self.zeros >= 2 => {
                    self.zeros = 0;
                    self.expect_header = true;
                }
                _ => self.zeros = 0,
            }
        }
        command
    }

    fn on_nal(&mut self, class: NalClass, now: Instant) -> Option<KeyframeCommand> {
        match class {
            NalClass::Keyframe => self.frame_is_key = true,
            NalClass::Slice => {}
            _ => return None,
        }
        self.slices_in_frame += 1;
        if self.slices_in_frame < self.slices_per_frame {
            return None;
        }
        let is_key = self.frame_is_key;
        self.slices_in_frame = 0;
        self.frame_is_key = false;
        self.on_frame(is_key, now)
    }

    fn on_frame(&mut self, is_key: bool, now: Instant) -> Option<KeyframeCommand> {
        self.stats.frames += 1;
        self.stats.last_frame_bytes = self.frame_bytes;
        self.stats.max_frame_bytes = self.stats.max_frame_bytes.max(self.frame_bytes);
        self.frame_bytes = 0;
        if let Some(prev) = self.last_frame_at {
            let dt: Duration = now.saturating_duration_since(prev);
            self.stats.frame_interval_us =
                self.frame_interval.update(dt.as_micros() as f64).round() as u64;
        }
        self.last_frame_at = Some(now);

        if is_key {
            self.stats.keyframes += 1;
            if self.seen_keyframe {
                let measured = self.frames_since_keyframe + 1;
                self.stats.measured_keyframe_interval = measured;
                if self.interval == 0 && self.pending.is_none() {
                    self.interval = measured.clamp(MIN_KEYFRAME_INTERVAL, MAX_KEYFRAME_INTERVAL);
                    tracing::info!(interval = self.interval, "learned keyframe interval");
                }
            }
            self.seen_keyframe = true;
            self.frames_since_keyframe = 0;
            return None;
        }
        self.frames_since_keyframe += 1;
        self.try_apply_pending()
    }

    fn try_apply_pending(&mut self) -> Option<KeyframeCommand> {
        let pending = self.pending?;
        let current = self.interval;
        let fsk = self.frames_since_keyframe;
        let due = if current == 0 {
            true
        } else if pending > current {
            if current < 12 {
                fsk > current / 2
            } else {
                fsk > current - 5
            }
        } else if current < 12 {
            fsk >= pending.saturating_sub(1)
        } else {
            fsk > pending.saturating_sub(5)
        };
        if !due {
            return None;
        }
        self.pending = None;
        tracing::info!(
            from = current,
            to = pending,
            frames_since_keyframe = fsk,
            "keyframe interval applied"
        );
        self.interval = pending;
        Some(KeyframeCommand::new(pending))
    }
}
