//! # Radio Dispatch
//!
//! Hands framed packets to every radio interface that should carry them.
//!
//! The physical driver sits behind [`RadioInterface`]; this module decides
//! which interfaces get a packet, picks the datarate, stamps the
//! per-interface link packet index and re-seals the frame for each write.
//! A failing interface is logged and counted; the other interfaces still
//! get the packet.

use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::error::TransportError;
use crate::serial::{split_into_short_packets, ShortPacketReassembler};
use crate::stats::InterfaceStats;
use crate::wire::{ext_flags, seal, set_frame_radio_link_index};

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Interface capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u16);

impl Capabilities {
    pub const CAN_TX: u16 = 1 << 0;
    pub const CAN_RX: u16 = 1 << 1;
    pub const VIDEO: u16 = 1 << 2;
    pub const DATA: u16 = 1 << 3;
    pub const RELAY: u16 = 1 << 4;
    pub const DISABLED: u16 = 1 << 5;
    pub const HIGH_CAPACITY: u16 = 1 << 6;

    /// Plain bidirectional video + data link.
    pub const fn full() -> Self {
        Capabilities(Self::CAN_TX | Self::CAN_RX | Self::VIDEO | Self::DATA | Self::HIGH_CAPACITY)
    }

    pub fn has(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn with(self, bits: u16) -> Self {
        Capabilities(self.0 | bits)
    }

    pub fn without(self, bits: u16) -> Self {
        Capabilities(self.0 & !bits)
    }

    /// Parse a capability name as used in configuration files.
    pub fn bit_from_name(name: &str) -> Option<u16> {
        match name {
            "tx" | "can_tx" => Some(Self::CAN_TX),
            "rx" | "can_rx" => Some(Self::CAN_RX),
            "video" => Some(Self::VIDEO),
            "data" => Some(Self::DATA),
            "relay" => Some(Self::RELAY),
            "disabled" => Some(Self::DISABLED),
            "high_capacity" => Some(Self::HIGH_CAPACITY),
            _ => None,
        }
    }
}

// ─── Datarate ───────────────────────────────────────────────────────────────

/// Radio datarate in the driver's encoding: positive values are legacy
/// rates in Mbit/s, negative values are MCS indices as `-(mcs + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Datarate(pub i32);

const MCS_KBPS: [u32; 8] = [6_500, 13_000, 19_500, 26_000, 39_000, 52_000, 58_500, 65_000];

impl Datarate {
    pub const fn legacy_mbps(mbps: i32) -> Self {
        Datarate(mbps)
    }

    pub const fn mcs(index: i32) -> Self {
        Datarate(-(index + 1))
    }

    /// Nominal rate for comparisons.
    pub fn kbps(self) -> u32 {
        match self.0 {
            r if r > 0 => r as u32 * 1000,
            r if r < 0 => {
                let mcs = (-r - 1) as usize;
                MCS_KBPS[mcs.min(MCS_KBPS.len() - 1)]
            }
            _ => 0,
        }
    }
}

impl Default for Datarate {
    fn default() -> Self {
        Datarate::legacy_mbps(18)
    }
}

/// Applies increases at once, decreases only after they have been asked for
/// continuously for the hold time.
#[derive(Debug, Clone)]
pub struct DatarateTracker {
    current: Option<Datarate>,
    lower_since: Option<Instant>,
    hold: Duration,
}

impl DatarateTracker {
    pub fn new(hold: Duration) -> Self {
        DatarateTracker {
            current: None,
            lower_since: None,
            hold,
        }
    }

    pub fn select(&mut self, requested: Datarate, now: Instant) -> Datarate {
        let Some(current) = self.current else {
            self.current = Some(requested);
            return requested;
        };
        if requested.kbps() >= current.kbps() {
            self.current = Some(requested);
            self.lower_since = None;
            return requested;
        }
        match self.lower_since {
            None => {
                self.lower_since = Some(now);
                current
            }
            Some(since) if now.saturating_duration_since(since) >= self.hold => {
                self.current = Some(requested);
                self.lower_since = None;
                requested
            }
            Some(_) => current,
        }
    }
}

// ─── Interface ──────────────────────────────────────────────────────────────

/// The driver boundary for one radio interface.
pub trait RadioInterface {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn is_open_for_write(&self) -> bool;

    fn is_open_for_read(&self) -> bool;

    fn supports_frequency(&self, frequency_khz: u32) -> bool;

    fn set_frequency(&mut self, frequency_khz: u32) -> anyhow::Result<()>;

    /// Air frame size for low-capacity serial links, `None` for packet
    /// radios that take full frames.
    fn air_packet_size(&self) -> Option<usize> {
        None
    }

    /// Transmit one frame. Returns the number of bytes accepted.
    fn write(&mut self, frame: &[u8], datarate: Datarate) -> anyhow::Result<usize>;

    /// Next received frame or byte chunk, `None` when nothing is pending.
    fn read(&mut self) -> anyhow::Result<Option<Bytes>>;
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub video_datarate: Datarate,
    pub data_datarate: Datarate,
    /// How long a lower video datarate must be requested before use.
    pub lower_datarate_hold: Duration,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            video_datarate: Datarate::default(),
            data_datarate: Datarate::legacy_mbps(6),
            lower_datarate_hold: Duration::from_millis(200),
        }
    }
}

struct RadioLink {
    iface: Box<dyn RadioInterface>,
    link_packet_index: u16,
    short_packet_id: u8,
    datarate: DatarateTracker,
    reassembler: ShortPacketReassembler,
    stats: InterfaceStats,
}

pub struct RadioDispatcher {
    links: Vec<RadioLink>,
    config: RadioConfig,
    requested_video_datarate: Datarate,
}

impl RadioDispatcher {
    pub fn new(config: RadioConfig) -> Self {
        RadioDispatcher {
            links: Vec::new(),
            requested_video_datarate: config.video_datarate,
            config,
        }
    }

    pub fn add_interface(&mut self, iface: Box<dyn RadioInterface>) -> usize {
        tracing::info!(
            interface = iface.name(),
            capabilities = iface.capabilities().0,
            serial = iface.air_packet_size().is_some(),
            "radio interface added"
        );
        let stats = InterfaceStats {
            name: iface.name().to_string(),
            ..Default::default()
        };
        self.links.push(RadioLink {
            iface,
            link_packet_index: 0,
            short_packet_id: 0,
            datarate: DatarateTracker::new(self.config.lower_datarate_hold),
            reassembler: ShortPacketReassembler::new(),
            stats,
        });
        self.links.len() - 1
    }

    pub fn interface_count(&self) -> usize {
        self.links.len()
    }

    /// Video datarate the link-quality logic is asking for.
    pub fn set_video_datarate(&mut self, datarate: Datarate) {
        self.requested_video_datarate = datarate;
    }

    pub fn interface_stats(&self) -> Vec<InterfaceStats> {
        self.links.iter().map(|l| l.stats.clone()).collect()
    }

    /// Tune every interface that supports `frequency_khz`.
    ///
    /// Fails only when no interface supports it at all.
    pub fn open_for_frequency(&mut self, frequency_khz: u32) -> Result<usize, TransportError> {
        let mut tuned = 0;
        for link in &mut self.links {
            if !link.iface.supports_frequency(frequency_khz) {
                continue;
            }
            match link.iface.set_frequency(frequency_khz) {
                Ok(()) => tuned += 1,
                Err(e) => tracing::warn!(
                    interface = link.iface.name(),
                    frequency_khz,
                    error = %e,
                    "failed to set frequency"
                ),
            }
        }
        if tuned == 0 {
            tracing::error!(frequency_khz, "no radio interface for frequency");
            return Err(TransportError::NoInterfaceForFrequency { frequency_khz });
        }
        Ok(tuned)
    }

    /// Send `frame` on every eligible interface. `frame` must be a sealed
    /// packet; it is restamped and re-sealed per interface.
    ///
    /// Returns `false` only when no interface accepted it.
    pub fn send(
        &mut self,
        is_video: bool,
        frame: &mut [u8],
        is_retransmission: bool,
        now: Instant,
    ) -> bool {
        let ext = frame
            .get(10..12)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or(0);
        let mut delivered = false;

        for link in &mut self.links {
            let caps = link.iface.capabilities();
            if caps.has(Capabilities::RELAY) || caps.has(Capabilities::DISABLED) {
                continue;
            }
            let class = if is_video { Capabilities::VIDEO } else { Capabilities::DATA };
            if !caps.has(Capabilities::CAN_TX) || !caps.has(class) {
                continue;
            }
            let air_size = link.iface.air_packet_size();
            if air_size.is_some() && is_video {
                continue;
            }
            if ext & ext_flags::HIGH_CAPACITY_LINK_ONLY != 0 && air_size.is_some() {
                continue;
            }
            if ext & ext_flags::LOW_CAPACITY_LINK_ONLY != 0 && air_size.is_none() {
                continue;
            }
            if !link.iface.is_open_for_write() {
                continue;
            }

            set_frame_radio_link_index(frame, link.link_packet_index);
            link.link_packet_index = link.link_packet_index.wrapping_add(1);
            seal(frame);

            let result = match air_size {
                Some(size) => write_short_packets(link, frame, size, self.config.data_datarate),
                None => {
                    let datarate = if !is_video {
                        self.config.data_datarate
                    } else if is_retransmission {
                        self.requested_video_datarate
                    } else {
                        link.datarate.select(self.requested_video_datarate, now)
                    };
                    if is_video {
                        link.stats.last_datarate = datarate.0;
                    }
                    link.iface.write(frame, datarate)
                }
            };

            match result {
                Ok(written) => {
                    link.stats.frames_written += 1;
                    link.stats.bytes_written += written as u64;
                    delivered = true;
                }
                Err(e) => {
                    link.stats.write_failures += 1;
                    tracing::warn!(interface = link.iface.name(), error = %e, "radio write failed");
                }
            }
        }
        delivered
    }

    /// Poll every readable interface once. Serial interfaces return only
    /// completed packets.
    pub fn read_all(&mut self) -> Vec<(usize, Bytes)> {
        let mut out = Vec::new();
        for (idx, link) in self.links.iter_mut().enumerate() {
            let caps = link.iface.capabilities();
            if !caps.has(Capabilities::CAN_RX)
                || caps.has(Capabilities::DISABLED)
                || !link.iface.is_open_for_read()
            {
                continue;
            }
            loop {
                match link.iface.read() {
                    Ok(Some(bytes)) => {
                        if link.iface.air_packet_size().is_some() {
                            out.extend(link.reassembler.push(&bytes).into_iter().map(|p| (idx, p)));
                        } else {
                            out.push((idx, bytes));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(interface = link.iface.name(), error = %e, "radio read failed");
                        break;
                    }
                }
            }
        }
        out
    }
}

fn write_short_packets(
    link: &mut RadioLink,
    frame: &[u8],
    air_size: usize,
    datarate: Datarate,
) -> anyhow::Result<usize> {
    let parts = split_into_short_packets(frame, air_size, &mut link.short_packet_id, 0);
    let mut written = 0;
    for part in parts {
        written += link.iface.write(&part, datarate)?;
        link.stats.short_packets_written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::wire::{validate, Component, PacketHeader};

    type Log = Rc<RefCell<Vec<(Vec<u8>, Datarate)>>>;

    struct MockRadio {
        name: String,
        caps: Capabilities,
        air: Option<usize>,
        fail: bool,
        freq: u32,
        log: Log,
    }

    impl MockRadio {
        fn boxed(name: &str, caps: Capabilities, air: Option<usize>, fail: bool) -> (Box<Self>, Log) {
            let log: Log = Rc::default();
            let radio = MockRadio {
                name: name.into(),
                caps,
                air,
                fail,
                freq: 5_800_000,
                log: log.clone(),
            };
            (Box::new(radio), log)
        }
    }

    impl RadioInterface for MockRadio {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> Capabilities {
            self.caps
        }
        fn is_open_for_write(&self) -> bool {
            true
        }
        fn is_open_for_read(&self) -> bool {
            true
        }
        fn supports_frequency(&self, frequency_khz: u32) -> bool {
            frequency_khz == self.freq
        }
        fn set_frequency(&mut self, _frequency_khz: u32) -> anyhow::Result<()> {
            Ok(())
        }
        fn air_packet_size(&self) -> Option<usize> {
            self.air
        }
        fn write(&mut self, frame: &[u8], datarate: Datarate) -> anyhow::Result<usize> {
            if self.fail {
                anyhow::bail!("tx queue full");
            }
            self.log.borrow_mut().push((frame.to_vec(), datarate));
            Ok(frame.len())
        }
        fn read(&mut self) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }
    }

    fn frame(len: usize) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        PacketHeader::new(Component::Video, 22, (24 + len) as u16).encode(&mut buf);
        buf.extend(std::iter::repeat(7u8).take(len));
        seal(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn stamps_link_index_per_interface() {
        let now = Instant::now();
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let (a, log_a) = MockRadio::boxed("a", Capabilities::full(), None, false);
        d.add_interface(a);
        let mut f = frame(50);
        assert!(d.send(true, &mut f, false, now));
        assert!(d.send(true, &mut f, false, now));
        let log = log_a.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(PacketHeader::peek(&log[1].0).unwrap().radio_link_packet_index, 1);
        assert!(validate(&log[1].0));
    }

    #[test]
    fn failure_on_one_interface_does_not_stop_others() {
        let now = Instant::now();
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let (bad, _) = MockRadio::boxed("bad", Capabilities::full(), None, true);
        let (good, log) = MockRadio::boxed("good", Capabilities::full(), None, false);
        d.add_interface(bad);
        d.add_interface(good);
        let mut f = frame(10);
        assert!(d.send(true, &mut f, false, now));
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(d.interface_stats()[0].write_failures, 1);
    }

    #[test]
    fn all_failing_returns_false() {
        let now = Instant::now();
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let (bad, _) = MockRadio::boxed("bad", Capabilities::full(), None, true);
        d.add_interface(bad);
        assert!(!d.send(true, &mut frame(10), false, now));
    }

    #[test]
    fn skips_relay_and_class_mismatch() {
        let now = Instant::now();
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let (relay, relay_log) =
            MockRadio::boxed("relay", Capabilities::full().with(Capabilities::RELAY), None, false);
        let (data_only, data_log) = MockRadio::boxed(
            "data",
            Capabilities::full().without(Capabilities::VIDEO),
            None,
            false,
        );
        d.add_interface(relay);
        d.add_interface(data_only);
        assert!(!d.send(true, &mut frame(10), false, now));
        assert!(relay_log.borrow().is_empty());
        assert!(data_log.borrow().is_empty());
        assert!(d.send(false, &mut frame(10), false, now));
        assert_eq!(data_log.borrow().len(), 1);
    }

    #[test]
    fn serial_links_carry_data_as_short_packets() {
        let now = Instant::now();
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let caps = Capabilities::full().without(Capabilities::HIGH_CAPACITY);
        let (serial, log) = MockRadio::boxed("serial", caps, Some(64), false);
        d.add_interface(serial);
        assert!(!d.send(true, &mut frame(200), false, now));
        assert!(d.send(false, &mut frame(200), false, now));
        let writes = log.borrow();
        assert_eq!(writes.len(), 4);

        let mut r = ShortPacketReassembler::new();
        let out: Vec<Bytes> = writes.iter().flat_map(|(w, _)| r.push(w)).collect();
        assert_eq!(out.len(), 1);
        assert!(validate(&out[0]));
    }

    #[test]
    fn datarate_lowering_waits_for_hold() {
        let t0 = Instant::now();
        let mut t = DatarateTracker::new(Duration::from_millis(200));
        assert_eq!(t.select(Datarate::mcs(3), t0), Datarate::mcs(3));
        assert_eq!(t.select(Datarate::mcs(1), t0), Datarate::mcs(3));
        assert_eq!(
            t.select(Datarate::mcs(1), t0 + Duration::from_millis(100)),
            Datarate::mcs(3)
        );
        assert_eq!(
            t.select(Datarate::mcs(1), t0 + Duration::from_millis(200)),
            Datarate::mcs(1)
        );
        assert_eq!(
            t.select(Datarate::mcs(5), t0 + Duration::from_millis(201)),
            Datarate::mcs(5)
        );
    }

    #[test]
    fn frequency_without_interface_is_an_error() {
        let mut d = RadioDispatcher::new(RadioConfig::default());
        let (a, _) = MockRadio::boxed("a", Capabilities::full(), None, false);
        d.add_interface(a);
        assert_eq!(d.open_for_frequency(5_800_000).unwrap(), 1);
        assert!(matches!(
            d.open_for_frequency(2_412_000),
            Err(TransportError::NoInterfaceForFrequency { frequency_khz: 2_412_000 })
        ));
    }
}
