//! # Encoding-Change Gate
//!
//! Video profiles, the link state reported by the link-quality estimator,
//! and the gate that moves the scheduler onto a new encoding only between
//! blocks. Signalling a change just raises a flag; the scheduler calls
//! [`EncodingGate::apply`] from its block-advance step, so every packet of
//! a block shares one `(K, M, packet length, profile)`.

use serde::Serialize;

use crate::error::TransportError;
use crate::wire::{
    DuplicationSetting, EncodingFlags, MAX_DATA_PACKETS, MAX_PACKET_PAYLOAD, MAX_PARITY_PACKETS,
};

// ─── Profiles ────────────────────────────────────────────────────────────────

/// Well-known profile ids.
pub mod profile_id {
    pub const HIGH_QUALITY: u8 = 0;
    pub const BEST_PERF: u8 = 1;
    pub const USER: u8 = 2;
    pub const MQ: u8 = 3;
    /// Lowest-quality profile the estimator falls back to.
    pub const LQ: u8 = 4;
    pub const PIP: u8 = 5;
}

/// One entry of the vehicle's video profile table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoProfile {
    pub id: u8,
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub bitrate_bps: u32,
    pub data_packets: usize,
    pub parity_packets: usize,
    pub packet_length: usize,
    /// Keyframe interval in frames, 0 when the encoder decides.
    pub keyframe_interval: u32,
    #[serde(skip)]
    pub encoding_flags: EncodingFlags,
}

impl VideoProfile {
    pub fn new(
        id: u8,
        name: &str,
        bitrate_bps: u32,
        (data_packets, parity_packets, packet_length): (usize, usize, usize),
        duplication: DuplicationSetting,
    ) -> Self {
        VideoProfile {
            id,
            name: name.to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps,
            data_packets,
            parity_packets,
            packet_length,
            keyframe_interval: 0,
            encoding_flags: EncodingFlags::default()
                .with_retransmissions(true)
                .with_retransmission_window_ms(80)
                .with_duplication(duplication),
        }
    }

    /// The stock profile table.
    pub fn defaults() -> Vec<VideoProfile> {
        use profile_id::*;
        vec![
            Self::new(HIGH_QUALITY, "high-quality", 7_000_000, (6, 2, 1250), DuplicationSetting::Off),
            Self::new(BEST_PERF, "best-perf", 7_000_000, (4, 1, 1250), DuplicationSetting::Off),
            Self::new(USER, "user", 7_000_000, (6, 2, 1250), DuplicationSetting::Off),
            Self::new(MQ, "mq", 4_500_000, (6, 3, 1250), DuplicationSetting::Off),
            Self::new(LQ, "lq", 2_000_000, (6, 3, 1200), DuplicationSetting::Auto),
        ]
    }
}

// ─── Encoding Params ─────────────────────────────────────────────────────────

/// Per-block encoding configuration written into every video header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingParams {
    pub profile: u8,
    pub encoding_flags: EncodingFlags,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub data_packets: usize,
    pub parity_packets: usize,
    pub packet_length: usize,
}

impl EncodingParams {
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(1..=MAX_DATA_PACKETS).contains(&self.data_packets) {
            return Err(TransportError::InvalidEncoding(format!(
                "data packets {} not in 1..={MAX_DATA_PACKETS}",
                self.data_packets
            )));
        }
        if self.parity_packets > MAX_PARITY_PACKETS {
            return Err(TransportError::InvalidEncoding(format!(
                "parity packets {} above {MAX_PARITY_PACKETS}",
                self.parity_packets
            )));
        }
        if !(1..=MAX_PACKET_PAYLOAD).contains(&self.packet_length) {
            return Err(TransportError::InvalidEncoding(format!(
                "packet length {} not in 1..={MAX_PACKET_PAYLOAD}",
                self.packet_length
            )));
        }
        Ok(())
    }

    /// Equal apart from transient status bits.
    pub fn same_encoding(&self, other: &EncodingParams) -> bool {
        let strip = |p: &EncodingParams| EncodingParams {
            encoding_flags: p.encoding_flags.without_status(),
            ..*p
        };
        strip(self) == strip(other)
    }
}

// ─── Link State ──────────────────────────────────────────────────────────────

/// Estimator-driven adjustments on top of the active profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkOverrides {
    pub profile: u8,
    /// Data packets per block; 0 uses the profile's data/parity counts.
    pub data_packets: usize,
    pub parity_packets: usize,
    /// How many quality levels the link has shifted down.
    pub shift_level: u8,
    pub lower_bitrate: bool,
}

/// Externally supplied encoding configuration, read by the gate.
#[derive(Debug, Clone)]
pub struct LinkState {
    profiles: Vec<VideoProfile>,
    pub overrides: LinkOverrides,
}

impl LinkState {
    pub fn new(profiles: Vec<VideoProfile>, initial_profile: u8) -> Result<Self, TransportError> {
        if profiles.is_empty() {
            return Err(TransportError::Config("no video profiles".into()));
        }
        let state = LinkState {
            profiles,
            overrides: LinkOverrides {
                profile: initial_profile,
                ..Default::default()
            },
        };
        if state.profile(initial_profile).is_none() {
            return Err(TransportError::Config(format!(
                "initial profile {initial_profile} not defined"
            )));
        }
        state.encoding().validate()?;
        Ok(state)
    }

    pub fn profile(&self, id: u8) -> Option<&VideoProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn profiles(&self) -> &[VideoProfile] {
        &self.profiles
    }

    /// Active profile, falling back to the first table entry for unknown ids.
    pub fn active_profile(&self) -> &VideoProfile {
        self.profile(self.overrides.profile)
            .unwrap_or(&self.profiles[0])
    }

    /// Encoding the next block should use.
    pub fn encoding(&self) -> EncodingParams {
        let p = self.active_profile();
        let (data_packets, parity_packets) = if self.overrides.data_packets > 0 {
            (self.overrides.data_packets, self.overrides.parity_packets)
        } else {
            (p.data_packets, p.parity_packets)
        };
        EncodingParams {
            profile: p.id,
            encoding_flags: p.encoding_flags.with_lower_bitrate(self.overrides.lower_bitrate),
            width: p.width,
            height: p.height,
            fps: p.fps,
            data_packets,
            parity_packets,
            packet_length: p.packet_length,
        }
    }
}

// ─── Gate ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EncodingGate {
    pending: bool,
    last_change_block: Option<u32>,
    changes: u64,
}

impl EncodingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_change(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Block index at which the last change took effect.
    pub fn last_change_block(&self) -> Option<u32> {
        self.last_change_block
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Apply a pending change as `block_index` starts. Returns `true` when
    /// the encoding actually changed.
    ///
    /// Invalid link configurations are rejected and the current encoding
    /// kept.
    pub fn apply(
        &mut self,
        block_index: u32,
        current: &mut EncodingParams,
        link: &LinkState,
    ) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;

        let next = link.encoding();
        if let Err(e) = next.validate() {
            tracing::warn!(block = block_index, error = %e, "rejected encoding change");
            return false;
        }
        if next.same_encoding(current) {
            *current = next;
            return false;
        }

        tracing::info!(
            block = block_index,
            profile = next.profile,
            data = next.data_packets,
            parity = next.parity_packets,
            packet_length = next.packet_length,
            prev_profile = current.profile,
            prev_data = current.data_packets,
            prev_parity = current.parity_packets,
            "encoding changed"
        );
        *current = next;
        self.changes += 1;
        self.last_change_block = Some(block_index);
        true
    }
}
