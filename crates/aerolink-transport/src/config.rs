//! # Configuration
//!
//! TOML configuration for the transmit side. Everything is optional: the
//! `*Input` structs mirror the file, [`TransportConfigInput::resolve`]
//! fills defaults and validates, and an empty file yields
//! [`TransportConfig::default`].

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::arq::{DuplicationPolicy, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_WINDOW};
use crate::error::TransportError;
use crate::fault::{FaultInjector, NoFaults, RandomFaults, ScriptedFaults};
use crate::gate::{profile_id, LinkState, VideoProfile};
use crate::pool::{DEFAULT_RING_DEPTH, MAX_RING_DEPTH, MIN_RING_DEPTH};
use crate::radio::{Capabilities, Datarate, RadioConfig};
use crate::runtime::{LoopConfig, SendMode};
use crate::sender::{ClockSyncMode, SchedulerConfig};
use crate::wire::{DuplicationSetting, MAX_PACKET_PAYLOAD};

// ─── Input (file) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub vehicle_id: Option<u32>,
    pub scheduler: SchedulerInput,
    pub retransmissions: RetransmissionsInput,
    #[serde(rename = "loop")]
    pub loop_: LoopInput,
    pub radio: RadioInput,
    pub profiles: Vec<ProfileInput>,
    pub faults: FaultsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerInput {
    pub ring_depth: Option<usize>,
    /// `"basic"` or `"advanced"`.
    pub clock_sync: Option<String>,
    /// `"blocks"` or `"trickle"`.
    pub send_mode: Option<String>,
    pub trickle_batch: Option<usize>,
    pub initial_profile: Option<u8>,
    pub keyframe_interval: Option<u32>,
    pub slices_per_frame: Option<u32>,
    pub stream_index: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetransmissionsInput {
    pub history_window_ms: Option<u64>,
    pub history_capacity: Option<usize>,
    /// Eleven entries, indexed by duplication percent / 10.
    pub duplication_curve: Option<Vec<u32>>,
    pub auto_duplication_profile: Option<u8>,
    pub auto_duplication_min_shift: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoopInput {
    pub poll_timeout_ms: Option<u64>,
    pub iteration_budget_ms: Option<u64>,
    pub stall_threshold_ms: Option<u64>,
    pub housekeeping_interval_ms: Option<u64>,
    pub rate_interval_ms: Option<u64>,
    pub stats_interval_ms: Option<u64>,
    pub max_control_messages: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RadioInput {
    pub video_datarate: Option<i32>,
    pub data_datarate: Option<i32>,
    pub lower_datarate_hold_ms: Option<u64>,
    pub interfaces: Vec<InterfaceInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterfaceInput {
    pub name: Option<String>,
    /// Only `"udp"` is understood.
    pub kind: Option<String>,
    pub target: String,
    pub bind: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub frequency_khz: Option<u32>,
    pub air_packet_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileInput {
    pub id: u8,
    pub name: Option<String>,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub fps: Option<u8>,
    pub bitrate_bps: Option<u32>,
    pub data_packets: Option<usize>,
    pub parity_packets: Option<usize>,
    pub packet_length: Option<usize>,
    pub keyframe_interval: Option<u32>,
    pub retransmissions: Option<bool>,
    pub retransmission_window_ms: Option<u32>,
    /// `"off"`, `"auto"` or a percentage such as `"30"` or `"30%"`.
    pub duplication: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FaultsInput {
    /// `"none"`, `"random"` or `"scripted"`.
    pub mode: Option<String>,
    pub seed: Option<u64>,
    pub short_burst_odds: Option<u32>,
    pub long_burst_odds: Option<u32>,
    /// `[block, packet]` pairs whose first transmission is dropped.
    pub drops: Vec<(u32, u8)>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub target: SocketAddr,
    pub bind: SocketAddr,
    pub capabilities: Capabilities,
    pub frequency_khz: Option<u32>,
    pub air_packet_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RadioSettings {
    pub dispatch: RadioConfig,
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FaultConfig {
    #[default]
    None,
    Random {
        seed: u64,
        short_burst_odds: u32,
        long_burst_odds: u32,
    },
    Scripted(Vec<(u32, u8)>),
}

impl FaultConfig {
    pub fn injector(&self) -> Box<dyn FaultInjector> {
        match self {
            FaultConfig::None => Box::new(NoFaults),
            FaultConfig::Random {
                seed,
                short_burst_odds,
                long_burst_odds,
            } => Box::new(RandomFaults::with_odds(*seed, *short_burst_odds, *long_burst_odds)),
            FaultConfig::Scripted(drops) => Box::new(ScriptedFaults::new(drops.iter().copied())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub scheduler: SchedulerConfig,
    pub initial_profile: u8,
    pub send_mode: SendMode,
    pub loop_: LoopConfig,
    pub radio: RadioSettings,
    pub profiles: Vec<VideoProfile>,
    pub faults: FaultConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            scheduler: SchedulerConfig::default(),
            initial_profile: profile_id::HIGH_QUALITY,
            send_mode: SendMode::default(),
            loop_: LoopConfig::default(),
            radio: RadioSettings::default(),
            profiles: VideoProfile::defaults(),
            faults: FaultConfig::None,
        }
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, TransportError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    /// Link state seeded with the profile table and initial profile.
    pub fn link_state(&self) -> Result<LinkState, TransportError> {
        LinkState::new(self.profiles.clone(), self.initial_profile)
    }
}

fn config_err(msg: impl Into<String>) -> TransportError {
    TransportError::Config(msg.into())
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, TransportError> {
        let defaults = TransportConfig::default();
        let scheduler = resolve_scheduler(
            &self.scheduler,
            &self.retransmissions,
            self.vehicle_id.unwrap_or(0),
        )?;

        let send_mode = match self.scheduler.send_mode.as_deref() {
            None | Some("blocks") => SendMode::Blocks,
            Some("trickle") => SendMode::Trickle {
                max_packets: self.scheduler.trickle_batch.unwrap_or(4).max(1),
            },
            Some(other) => return Err(config_err(format!("unknown send mode {other:?}"))),
        };

        let l = &self.loop_;
        let d = &defaults.loop_;
        let loop_ = LoopConfig {
            poll_timeout: millis(l.poll_timeout_ms, d.poll_timeout),
            iteration_budget: millis(l.iteration_budget_ms, d.iteration_budget),
            stall_threshold: millis(l.stall_threshold_ms, d.stall_threshold),
            housekeeping_interval: millis(l.housekeeping_interval_ms, d.housekeeping_interval),
            rate_interval: millis(l.rate_interval_ms, d.rate_interval),
            stats_interval: millis(l.stats_interval_ms, d.stats_interval),
            max_control_messages: l.max_control_messages.unwrap_or(d.max_control_messages).max(1),
        };

        let profiles = resolve_profiles(self.profiles)?;
        let initial_profile = self.scheduler.initial_profile.unwrap_or(profile_id::HIGH_QUALITY);
        if !profiles.iter().any(|p| p.id == initial_profile) {
            return Err(config_err(format!("initial profile {initial_profile} not defined")));
        }

        Ok(TransportConfig {
            scheduler,
            initial_profile,
            send_mode,
            loop_,
            radio: resolve_radio(self.radio)?,
            profiles,
            faults: resolve_faults(self.faults)?,
        })
    }
}

fn resolve_scheduler(
    s: &SchedulerInput,
    r: &RetransmissionsInput,
    vehicle_id: u32,
) -> Result<SchedulerConfig, TransportError> {
    let ring_depth = s.ring_depth.unwrap_or(DEFAULT_RING_DEPTH);
    if !(MIN_RING_DEPTH..=MAX_RING_DEPTH).contains(&ring_depth) {
        return Err(TransportError::RingDepth {
            depth: ring_depth,
            min: MIN_RING_DEPTH,
            max: MAX_RING_DEPTH,
        });
    }
    let clock_sync = match s.clock_sync.as_deref() {
        None | Some("basic") => ClockSyncMode::Basic,
        Some("advanced") => ClockSyncMode::Advanced,
        Some(other) => return Err(config_err(format!("unknown clock sync mode {other:?}"))),
    };

    let mut duplication = DuplicationPolicy::default();
    if let Some(curve) = &r.duplication_curve {
        duplication.interval_by_percent = curve
            .as_slice()
            .try_into()
            .map_err(|_| config_err(format!("duplication curve needs 11 entries, got {}", curve.len())))?;
    }
    if let Some(p) = r.auto_duplication_profile {
        duplication.auto_profile = p;
    }
    if let Some(shift) = r.auto_duplication_min_shift {
        duplication.auto_min_shift = shift;
    }

    Ok(SchedulerConfig {
        vehicle_id,
        ring_depth,
        clock_sync,
        stream_index: s.stream_index.unwrap_or(0) & 0x0F,
        slices_per_frame: s.slices_per_frame.unwrap_or(1).max(1),
        keyframe_interval: s.keyframe_interval.unwrap_or(0),
        history_window: millis(r.history_window_ms, DEFAULT_HISTORY_WINDOW),
        history_capacity: r.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY).max(1),
        duplication,
    })
}

fn parse_duplication(value: &str) -> Result<DuplicationSetting, TransportError> {
    match value.trim() {
        "off" => Ok(DuplicationSetting::Off),
        "auto" => Ok(DuplicationSetting::Auto),
        pct => {
            let n: u8 = pct
                .trim_end_matches('%')
                .parse()
                .map_err(|_| config_err(format!("invalid duplication setting {value:?}")))?;
            if n > 100 {
                return Err(config_err(format!("duplication {n}% above 100")));
            }
            // Carried in steps of ten percent, rounded up.
            Ok(match n.div_ceil(10) {
                0 => DuplicationSetting::Off,
                tens => DuplicationSetting::Percent(tens),
            })
        }
    }
}

/// Entries replace the stock profile with the same id, or are appended.
fn resolve_profiles(inputs: Vec<ProfileInput>) -> Result<Vec<VideoProfile>, TransportError> {
    let mut profiles = VideoProfile::defaults();
    for input in inputs {
        let base = profiles
            .iter()
            .find(|p| p.id == input.id)
            .or_else(|| profiles.iter().find(|p| p.id == profile_id::HIGH_QUALITY))
            .cloned()
            .ok_or_else(|| config_err("no base profile"))?;

        let mut flags = base.encoding_flags;
        if let Some(on) = input.retransmissions {
            flags = flags.with_retransmissions(on);
        }
        if let Some(ms) = input.retransmission_window_ms {
            flags = flags.with_retransmission_window_ms(ms);
        }
        if let Some(dup) = &input.duplication {
            flags = flags.with_duplication(parse_duplication(dup)?);
        }

        let profile = VideoProfile {
            id: input.id,
            name: input.name.unwrap_or_else(|| format!("profile-{}", input.id)),
            width: input.width.unwrap_or(base.width),
            height: input.height.unwrap_or(base.height),
            fps: input.fps.unwrap_or(base.fps),
            bitrate_bps: input.bitrate_bps.unwrap_or(base.bitrate_bps),
            data_packets: input.data_packets.unwrap_or(base.data_packets),
            parity_packets: input.parity_packets.unwrap_or(base.parity_packets),
            packet_length: input.packet_length.unwrap_or(base.packet_length),
            keyframe_interval: input.keyframe_interval.unwrap_or(base.keyframe_interval),
            encoding_flags: flags,
        };
        if !(1..=MAX_PACKET_PAYLOAD).contains(&profile.packet_length) {
            return Err(config_err(format!(
                "profile {}: packet length {} not in 1..={MAX_PACKET_PAYLOAD}",
                profile.id, profile.packet_length
            )));
        }

        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
    }
    Ok(profiles)
}

fn resolve_radio(input: RadioInput) -> Result<RadioSettings, TransportError> {
    let defaults = RadioConfig::default();
    let dispatch = RadioConfig {
        video_datarate: input.video_datarate.map(Datarate).unwrap_or(defaults.video_datarate),
        data_datarate: input.data_datarate.map(Datarate).unwrap_or(defaults.data_datarate),
        lower_datarate_hold: millis(input.lower_datarate_hold_ms, defaults.lower_datarate_hold),
    };

    let mut interfaces = Vec::new();
    for (idx, iface) in input.interfaces.into_iter().enumerate() {
        match iface.kind.as_deref() {
            None | Some("udp") => {}
            Some(other) => return Err(config_err(format!("unknown interface kind {other:?}"))),
        }
        let target = iface
            .target
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| config_err(format!("interface {idx}: bad target {:?}: {e}", iface.target)))?;
        let bind = match iface.bind.as_deref().map(str::trim) {
            None | Some("") => SocketAddr::from(([0, 0, 0, 0], 0)),
            Some(b) => b
                .parse()
                .map_err(|e| config_err(format!("interface {idx}: bad bind {b:?}: {e}")))?,
        };
        let capabilities = match &iface.capabilities {
            None => Capabilities::full(),
            Some(names) => {
                let mut caps = Capabilities(0);
                for name in names {
                    let bit = Capabilities::bit_from_name(name.trim()).ok_or_else(|| {
                        config_err(format!("interface {idx}: unknown capability {name:?}"))
                    })?;
                    caps = caps.with(bit);
                }
                caps
            }
        };
        interfaces.push(InterfaceConfig {
            name: iface
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("radio{idx}")),
            target,
            bind,
            capabilities,
            frequency_khz: iface.frequency_khz,
            air_packet_size: iface.air_packet_size,
        });
    }
    Ok(RadioSettings {
        dispatch,
        interfaces,
    })
}

fn resolve_faults(input: FaultsInput) -> Result<FaultConfig, TransportError> {
    match input.mode.as_deref() {
        None | Some("none") => Ok(FaultConfig::None),
        Some("random") => Ok(FaultConfig::Random {
            seed: input.seed.unwrap_or(0),
            short_burst_odds: input.short_burst_odds.unwrap_or(200).max(1),
            long_burst_odds: input.long_burst_odds.unwrap_or(3000).max(1),
        }),
        Some("scripted") => Ok(FaultConfig::Scripted(input.drops)),
        Some(other) => Err(config_err(format!("unknown fault mode {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let cfg = TransportConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.scheduler.ring_depth, DEFAULT_RING_DEPTH);
        assert_eq!(cfg.send_mode, SendMode::Blocks);
        assert_eq!(cfg.profiles.len(), VideoProfile::defaults().len());
        assert!(cfg.radio.interfaces.is_empty());
        assert_eq!(cfg.faults, FaultConfig::None);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            vehicle_id = 77

            [scheduler]
            ring_depth = 64
            clock_sync = "advanced"
            send_mode = "trickle"
            trickle_batch = 8
            initial_profile = 3
            keyframe_interval = 90

            [retransmissions]
            history_window_ms = 300
            history_capacity = 50
            duplication_curve = [0, 10, 5, 4, 3, 2, 2, 1, 1, 0, 0]

            [loop]
            poll_timeout_ms = 5
            stall_threshold_ms = 1500

            [radio]
            video_datarate = -3
            lower_datarate_hold_ms = 500

            [[radio.interfaces]]
            name = "wlan0"
            target = "127.0.0.1:5600"
            frequency_khz = 5805000

            [[radio.interfaces]]
            target = "127.0.0.1:5601"
            capabilities = ["tx", "rx", "data"]
            air_packet_size = 64

            [[profiles]]
            id = 3
            data_packets = 8
            parity_packets = 4
            duplication = "30"

            [faults]
            mode = "scripted"
            drops = [[2, 1], [5, 0]]
        "#;
        let cfg = TransportConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.scheduler.vehicle_id, 77);
        assert_eq!(cfg.scheduler.ring_depth, 64);
        assert_eq!(cfg.scheduler.clock_sync, ClockSyncMode::Advanced);
        assert_eq!(cfg.send_mode, SendMode::Trickle { max_packets: 8 });
        assert_eq!(cfg.initial_profile, 3);
        assert_eq!(cfg.scheduler.keyframe_interval, 90);
        assert_eq!(cfg.scheduler.history_window, Duration::from_millis(300));
        assert_eq!(cfg.scheduler.duplication.interval_by_percent[1], 10);
        assert_eq!(cfg.loop_.poll_timeout, Duration::from_millis(5));
        assert_eq!(cfg.loop_.stall_threshold, Duration::from_millis(1500));
        assert_eq!(cfg.radio.dispatch.video_datarate, Datarate::mcs(2));

        let ifaces = &cfg.radio.interfaces;
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].name, "wlan0");
        assert_eq!(ifaces[0].capabilities, Capabilities::full());
        assert_eq!(ifaces[0].frequency_khz, Some(5_805_000));
        assert_eq!(ifaces[1].name, "radio1");
        assert!(!ifaces[1].capabilities.has(Capabilities::VIDEO));
        assert_eq!(ifaces[1].air_packet_size, Some(64));

        let mq = cfg.profiles.iter().find(|p| p.id == 3).unwrap();
        assert_eq!((mq.data_packets, mq.parity_packets), (8, 4));
        assert_eq!(mq.encoding_flags.duplication(), DuplicationSetting::Percent(3));

        assert_eq!(cfg.faults, FaultConfig::Scripted(vec![(2, 1), (5, 0)]));
        let link = cfg.link_state().unwrap();
        assert_eq!(link.encoding().data_packets, 8);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(TransportConfig::from_toml_str("[scheduler]\nring_depth = 2").is_err());
        assert!(TransportConfig::from_toml_str("[scheduler]\nclock_sync = \"fast\"").is_err());
        assert!(TransportConfig::from_toml_str("[scheduler]\ninitial_profile = 42").is_err());
        assert!(TransportConfig::from_toml_str(
            "[retransmissions]\nduplication_curve = [1, 2]"
        )
        .is_err());
        assert!(TransportConfig::from_toml_str(
            "[[radio.interfaces]]\ntarget = \"nowhere\""
        )
        .is_err());
        assert!(TransportConfig::from_toml_str("[[profiles]]\nid = 9\npacket_length = 5000").is_err());
        assert!(TransportConfig::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn new_profile_ids_are_appended() {
        let cfg = TransportConfig::from_toml_str(
            "[[profiles]]\nid = 9\nname = \"custom\"\ndata_packets = 2\nparity_packets = 1",
        )
        .unwrap();
        let p = cfg.profiles.iter().find(|p| p.id == 9).unwrap();
        assert_eq!(p.name, "custom");
        assert_eq!(p.packet_length, 1250);
    }
}
