//! # Transport Statistics
//!
//! Counters for the video scheduler, the retransmission responder and each
//! radio interface, plus the bitrate meters. A [`StatsSnapshot`] gathers
//! them for JSON export; [`publish_snapshot`] replaces the output file
//! atomically so readers never see a torn snapshot.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use quanta::Instant;
use serde::Serialize;

// ─── Scheduler Stats ────────────────────────────────────────────────────────

/// Video transmit counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TxStats {
    /// Packets handed to radio dispatch (originals, resends, duplicates).
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub original_packets: u64,
    pub retransmitted_packets: u64,
    /// Extra copies sent by the duplication policy.
    pub duplicated_packets: u64,
    pub blocks_completed: u64,
    pub parity_packets_generated: u64,
    pub encoding_changes: u64,
    /// Packets dropped by fault injection.
    pub fault_drops: u64,
    /// Packets no interface accepted.
    pub dispatch_failures: u64,
    /// Packets skipped while transmission was paused.
    pub paused_drops: u64,
    /// Unsent blocks recycled because the writer lapped the send cursor.
    pub ring_overruns: u64,
    /// Packets that left the trickle window without being sent.
    pub trickle_expired_packets: u64,
    pub input_bytes: u64,
    /// Erasure-coding time accumulated in the current window, µs.
    pub encode_time_us: u64,
    /// Erasure-coding time of the last complete window, µs.
    pub last_encode_window_us: u64,
}

impl TxStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the encode-time window.
    pub fn roll_encode_window(&mut self) {
        self.last_encode_window_us = self.encode_time_us;
        self.encode_time_us = 0;
    }

    /// Encode time of the last window, saturated to the header field.
    pub fn encode_time_hint(&self) -> u16 {
        self.last_encode_window_us.min(u16::MAX as u64) as u16
    }

    /// Share of sent packets that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retransmitted_packets as f64 / self.packets_sent as f64
        }
    }
}

// ─── Responder Stats ────────────────────────────────────────────────────────

/// Retransmission request counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetransmissionStats {
    pub requests_received: u64,
    /// Requests received since the last housekeeping window.
    pub requests_in_window: u64,
    pub requests_last_window: u64,
    pub segments_requested: u64,
    /// Segments not seen in the history window.
    pub segments_unique: u64,
    /// Segments asked for again within the history window.
    pub segments_retried: u64,
    pub segments_resent: u64,
    /// Segments no longer (or never) resident in the ring.
    pub segments_stale: u64,
    /// Requests dropped because retransmissions are disabled.
    pub requests_ignored: u64,
    pub last_request_id: u32,
}

impl RetransmissionStats {
    pub fn roll_window(&mut self) {
        self.requests_last_window = self.requests_in_window;
        self.requests_in_window = 0;
    }
}

// ─── Frame Stats ────────────────────────────────────────────────────────────

/// H.264 input stream statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameStats {
    pub frames: u64,
    pub keyframes: u64,
    /// Slices per frame assumed when counting frames.
    pub slices_per_frame: u32,
    /// Frames between the last two keyframes.
    pub measured_keyframe_interval: u32,
    pub last_frame_bytes: u64,
    pub max_frame_bytes: u64,
    /// Smoothed time between frames, µs.
    pub frame_interval_us: u64,
}

// ─── Interface Stats ────────────────────────────────────────────────────────

/// Per radio interface counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceStats {
    pub name: String,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub short_packets_written: u64,
    /// Datarate of the last video write, in the driver's encoding.
    pub last_datarate: i32,
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ─── Bitrate Meter ──────────────────────────────────────────────────────────

/// Byte counter sampled into a smoothed bits/s figure.
///
/// Every window the instant rate is folded in with weight 1/4.
#[derive(Debug, Clone)]
pub struct BitrateMeter {
    window: Duration,
    bytes: u64,
    window_start: Option<Instant>,
    smoothed: Ewma,
}

impl BitrateMeter {
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

    pub fn new(window: Duration) -> Self {
        BitrateMeter {
            window,
            bytes: 0,
            window_start: None,
            smoothed: Ewma::new(0.25),
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    /// Close the window if it has elapsed. Returns the smoothed rate when
    /// a window closed.
    pub fn tick(&mut self, now: Instant) -> Option<u64> {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.window {
            return None;
        }
        let instant_bps = self.bytes as f64 * 8.0 / elapsed.as_secs_f64();
        self.bytes = 0;
        self.window_start = Some(now);
        Some(self.smoothed.update(instant_bps).round() as u64)
    }

    pub fn bps(&self) -> u64 {
        self.smoothed.value().round() as u64
    }
}

impl Default for BitrateMeter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Everything published to the statistics file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub vehicle_id: u32,
    pub block_index: u32,
    pub profile: u8,
    pub data_packets: u8,
    pub parity_packets: u8,
    pub packet_length: u16,
    pub keyframe_interval: u32,
    pub paused: bool,
    pub input_bps: u64,
    pub output_bps: u64,
    pub tx: TxStats,
    pub video: FrameStats,
    pub retransmissions: RetransmissionStats,
    pub interfaces: Vec<InterfaceStats>,
    pub loop_overruns: u64,
    pub feed_stalls: u64,
    pub control_corrupt: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("serialize stats snapshot")
    }
}

/// Write `snapshot` as JSON to `path` via a temporary file and rename.
pub fn publish_snapshot(path: &Path, snapshot: &StatsSnapshot) -> anyhow::Result<()> {
    let json = snapshot.to_json()?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
