//! # Video Transmit Scheduler
//!
//! Pure logic apart from the radio boundary. Segments the H.264 byte stream
//! into fixed-size packets, groups them into erasure-coded blocks in the
//! transmit ring, and decides when each packet goes out.
//!
//! ## Block lifecycle
//!
//! 1. `feed` fills data packets of the block under the writer; each full
//!    packet becomes `Read`.
//! 2. The K-th data packet triggers parity encoding; parity packets become
//!    `Read` and the writer advances to the next block index. A pending
//!    encoding change is applied exactly here.
//! 3. Packets go out either as whole blocks (`send_first_complete_block`)
//!    or trickled as soon as they are ready (`send_packets_ready_to_send`).
//! 4. Retransmission requests re-send packets still resident in the ring.
//!
//! Sequence numbers are assigned at dispatch, one per packet sent.

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;

use crate::arq::{DuplicationContext, DuplicationPolicy, RetransmitResponder};
use crate::arq::{DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_WINDOW};
use crate::codec::ErasureCoder;
use crate::error::TransportError;
use crate::fault::{DispatchContext, FaultInjector, NoFaults};
use crate::gate::{EncodingGate, EncodingParams, LinkState};
use crate::nal::FrameTracker;
use crate::pool::{BlockRing, PacketState, RingIndex, SequenceGenerator, DEFAULT_RING_DEPTH};
use crate::radio::RadioDispatcher;
use crate::stats::{BitrateMeter, StatsSnapshot, TxStats};
use crate::wire::{
    compose_stream_index, flags, keyframe_hint, packet_type, seal, set_frame_flags,
    set_frame_stream_index, Component, EncodingUpdate, KeyframeCommand, PacketHeader,
    RetransmissionRequest, VideoBlockHeader, STREAM_ID_VIDEO, VIDEO_HEADERS_LEN,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// How the receiver is told it may start outputting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSyncMode {
    /// `CAN_START_TX` on the first packet of every freshly completed block.
    #[default]
    Basic,
    /// `CAN_START_TX` only on the last packet of the last block of a burst.
    Advanced,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub vehicle_id: u32,
    pub ring_depth: usize,
    pub clock_sync: ClockSyncMode,
    /// Video stream index carried in the video header.
    pub stream_index: u8,
    pub slices_per_frame: u32,
    /// Keyframe interval in frames; 0 uses the profile's, or learns it.
    pub keyframe_interval: u32,
    pub history_window: Duration,
    pub history_capacity: usize,
    pub duplication: DuplicationPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            vehicle_id: 0,
            ring_depth: DEFAULT_RING_DEPTH,
            clock_sync: ClockSyncMode::Basic,
            stream_index: 0,
            slices_per_frame: 1,
            keyframe_interval: 0,
            history_window: DEFAULT_HISTORY_WINDOW,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            duplication: DuplicationPolicy::default(),
        }
    }
}

/// Most recent slots the trickle path sends from.
pub const TRICKLE_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendKind {
    Original,
    Retransmission,
    Duplicate,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

pub struct Scheduler {
    config: SchedulerConfig,
    ring: BlockRing,
    /// Encoding of the block under the writer.
    encoding: EncodingParams,
    gate: EncodingGate,
    link: LinkState,
    coder: ErasureCoder,
    seq: SequenceGenerator,
    responder: RetransmitResponder,
    radio: RadioDispatcher,
    faults: Box<dyn FaultInjector>,
    frames: FrameTracker,
    keyframe_commands: VecDeque<KeyframeCommand>,
    stats: TxStats,
    input_rate: BitrateMeter,
    output_rate: BitrateMeter,
    paused: bool,
    block_index: u32,
    /// Data packet currently being filled.
    packet_index: usize,
    last_feed_at: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        link: LinkState,
        radio: RadioDispatcher,
    ) -> Result<Self, TransportError> {
        let encoding = link.encoding();
        encoding.validate()?;
        let coder = ErasureCoder::new(encoding.data_packets, encoding.parity_packets)?;
        let mut ring = BlockRing::new(config.ring_depth)?;
        ring.write_slot_mut().recycle(
            0,
            encoding.data_packets,
            encoding.parity_packets,
            encoding.packet_length,
        );
        let keyframe_interval = if config.keyframe_interval > 0 {
            config.keyframe_interval
        } else {
            link.active_profile().keyframe_interval
        };
        let responder = RetransmitResponder::new(
            config.history_window,
            config.history_capacity,
            config.duplication.clone(),
        );

        tracing::info!(
            vehicle_id = config.vehicle_id,
            ring_depth = config.ring_depth,
            profile = encoding.profile,
            data = encoding.data_packets,
            parity = encoding.parity_packets,
            packet_length = encoding.packet_length,
            "video scheduler started"
        );

        let mut scheduler = Scheduler {
            frames: FrameTracker::new(config.slices_per_frame, keyframe_interval),
            config,
            ring,
            encoding,
            gate: EncodingGate::new(),
            link,
            coder,
            seq: SequenceGenerator::new(),
            responder,
            radio,
            faults: Box::new(NoFaults),
            keyframe_commands: VecDeque::new(),
            stats: TxStats::new(),
            input_rate: BitrateMeter::default(),
            output_rate: BitrateMeter::default(),
            paused: false,
            block_index: 0,
            packet_index: 0,
            last_feed_at: None,
        };
        scheduler.prepare_packet(0);
        Ok(scheduler)
    }

    pub fn with_faults(mut self, faults: Box<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn current_block(&self) -> u32 {
        self.block_index
    }

    pub fn encoding(&self) -> &EncodingParams {
        &self.encoding
    }

    pub fn ring(&self) -> &BlockRing {
        &self.ring
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    /// Mutable access to the externally supplied link configuration. Call
    /// [`Scheduler::signal_encoding_change`] afterwards.
    pub fn link_mut(&mut self) -> &mut LinkState {
        &mut self.link
    }

    pub fn radio(&self) -> &RadioDispatcher {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut RadioDispatcher {
        &mut self.radio
    }

    pub fn gate(&self) -> &EncodingGate {
        &self.gate
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    pub fn responder(&self) -> &RetransmitResponder {
        &self.responder
    }

    pub fn frames(&self) -> &FrameTracker {
        &self.frames
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn last_feed_at(&self) -> Option<Instant> {
        self.last_feed_at
    }

    // ─── Input ──────────────────────────────────────────────────────────

    /// Append encoder output to the stream.
    pub fn feed(&mut self, data: &[u8], now: Instant) {
        self.stats.input_bytes += data.len() as u64;
        self.input_rate.record(data.len());
        self.last_feed_at = Some(now);
        if let Some(cmd) = self.frames.feed(data, now) {
            self.keyframe_commands.push_back(cmd);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let idx = self.packet_index;
            let slot = self.ring.write_slot_mut();
            let len = slot.packet_length;
            let packet = &mut slot.packets[idx];
            let fill = packet.fill;
            let n = (len - fill).min(rest.len());
            packet.payload_mut(len)[fill..fill + n].copy_from_slice(&rest[..n]);
            packet.fill += n;
            rest = &rest[n..];
            if packet.fill == len {
                self.complete_data_packet();
            }
        }
    }

    fn complete_data_packet(&mut self) {
        let idx = self.packet_index;
        let slot = self.ring.write_slot_mut();
        slot.packets[idx].state = PacketState::Read;
        let data_packets = slot.data_packets;

        self.packet_index += 1;
        if self.packet_index < data_packets {
            self.prepare_packet(self.packet_index);
            return;
        }
        self.encode_parity();
        self.advance_block();
    }

    fn encode_parity(&mut self) {
        let slot = self.ring.write_slot_mut();
        let (k, m, len) = (slot.data_packets, slot.parity_packets, slot.packet_length);
        if m > 0 {
            let start = Instant::now();
            let (data, mut parity) = slot.shards_mut();
            if let Err(e) = self.coder.encode(len, &data, &mut parity) {
                tracing::warn!(block = self.block_index, error = %e, "parity encode failed");
            }
            self.stats.encode_time_us += start.elapsed().as_micros() as u64;
        }
        for idx in k..k + m {
            self.prepare_packet(idx);
            self.ring.write_slot_mut().packets[idx].state = PacketState::Read;
        }
        self.stats.blocks_completed += 1;
        self.stats.parity_packets_generated += m as u64;
    }

    fn advance_block(&mut self) {
        let finished = self.block_index;
        self.block_index = self.block_index.wrapping_add(1);
        if self.gate.is_pending()
            && self
                .gate
                .apply(self.block_index, &mut self.encoding, &self.link)
        {
            self.stats.encoding_changes += 1;
            let (k, m) = (self.encoding.data_packets, self.encoding.parity_packets);
            if !self.coder.matches(k, m) {
                match ErasureCoder::new(k, m) {
                    Ok(coder) => self.coder = coder,
                    Err(e) => tracing::error!(error = %e, "erasure coder rebuild failed"),
                }
            }
        }
        self.encoding.encoding_flags = self
            .encoding
            .encoding_flags
            .with_lower_bitrate(self.link.overrides.lower_bitrate);
        let overrun = self.ring.advance(
            self.block_index,
            self.encoding.data_packets,
            self.encoding.parity_packets,
            self.encoding.packet_length,
        );
        if overrun {
            self.stats.ring_overruns += 1;
            tracing::warn!(
                block = self.block_index,
                newest_complete = finished,
                depth = self.ring.depth(),
                "transmit ring overrun, oldest unsent block recycled"
            );
        }
        self.packet_index = 0;
        self.prepare_packet(0);
    }

    /// Write both headers of packet `idx` in the block under the writer.
    fn prepare_packet(&mut self, idx: usize) {
        let enc = self.encoding;
        let total = VIDEO_HEADERS_LEN + enc.packet_length;
        let mut header = PacketHeader::new(Component::Video, packet_type::VIDEO_DATA, total as u16);
        header.packet_flags |= flags::HEADERS_ONLY_CRC;
        header.vehicle_id_src = self.config.vehicle_id;
        let video = VideoBlockHeader {
            stream_and_type: self.config.stream_index & 0x0F,
            profile: enc.profile,
            encoding_flags: enc.encoding_flags,
            width: enc.width,
            height: enc.height,
            fps: enc.fps,
            keyframe_hint: keyframe_hint(self.frames.keyframe_interval()),
            fec_time_us: self.stats.encode_time_hint(),
            last_request_id: 0,
            block_index: self.block_index,
            packet_index: idx as u8,
            data_packets: enc.data_packets as u8,
            parity_packets: enc.parity_packets as u8,
            packet_length: enc.packet_length as u16,
        };
        let frame = self.ring.write_slot_mut().packets[idx].frame_mut(enc.packet_length);
        header.write_to(frame);
        video.write_to(frame);
    }

    // ─── Block sending ──────────────────────────────────────────────────

    /// The oldest unsent block, if all its packets are ready.
    pub fn has_block_ready_to_send(&self) -> Option<RingIndex> {
        self.ring.first_complete_block()
    }

    /// Send every packet of the oldest complete block, data then parity.
    /// Returns the number of packets put on the air.
    pub fn send_first_complete_block(&mut self, is_last: bool, now: Instant) -> usize {
        let Some(idx) = self.ring.first_complete_block() else {
            return 0;
        };
        let total = self.ring.slot(idx).total_packets();
        let mut sent = 0;
        for p in 0..total {
            let can_start = match self.config.clock_sync {
                ClockSyncMode::Basic => p == 0,
                ClockSyncMode::Advanced => is_last && p + 1 == total,
            };
            if self.send_packet(idx, p, SendKind::Original, can_start, now) {
                sent += 1;
            }
        }
        self.ring.advance_send();
        sent
    }

    /// Send every complete block in order. The last one closes the burst.
    pub fn send_complete_blocks(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        while self.has_block_ready_to_send().is_some() {
            let is_last = self.ring.ready_blocks() <= 1;
            sent += self.send_first_complete_block(is_last, now);
        }
        sent
    }

    // ─── Trickle sending ────────────────────────────────────────────────

    /// Slots the trickle path looks at, oldest first.
    fn trickle_slots(&self) -> impl Iterator<Item = RingIndex> + '_ {
        let write = self.ring.write_index();
        (0..TRICKLE_WINDOW)
            .rev()
            .filter_map(move |n| write.back(n))
            .filter(|idx| self.ring.slot(*idx).block_index.is_some())
    }

    /// Packets ready but never sent in the three most recent blocks.
    pub fn has_packets_ready_to_send(&self) -> usize {
        self.trickle_slots()
            .map(|idx| {
                let slot = self.ring.slot(idx);
                slot.packets[..slot.total_packets()]
                    .iter()
                    .filter(|p| p.state == PacketState::Read)
                    .count()
            })
            .sum()
    }

    /// Send up to `max` ready packets, oldest first.
    ///
    /// In advanced clock sync only the last packet of the call carries
    /// `CAN_START_TX`.
    pub fn send_packets_ready_to_send(&mut self, max: usize, now: Instant) -> usize {
        self.retire_trickled_blocks();
        let mut queue = Vec::new();
        for idx in self.trickle_slots() {
            let slot = self.ring.slot(idx);
            let total = slot.total_packets();
            for p in 0..total {
                if queue.len() == max {
                    break;
                }
                if slot.packets[p].state == PacketState::Read {
                    queue.push((idx, p));
                }
            }
        }
        let last = queue.len().saturating_sub(1);
        let mut sent = 0;
        for (n, (idx, p)) in queue.into_iter().enumerate() {
            let can_start = match self.config.clock_sync {
                ClockSyncMode::Basic => p == 0,
                ClockSyncMode::Advanced => n == last,
            };
            if self.send_packet(idx, p, SendKind::Original, can_start, now) {
                sent += 1;
            }
        }
        self.retire_trickled_blocks();
        sent
    }

    /// Move the send cursor past blocks the trickle path is done with.
    /// Blocks leaving the trickle window with packets still unsent are
    /// counted once, as expired.
    fn retire_trickled_blocks(&mut self) {
        loop {
            let idx = self.ring.send_index();
            if idx == self.ring.write_index() {
                break;
            }
            let slot = self.ring.slot(idx);
            let unsent = slot.packets[..slot.total_packets()]
                .iter()
                .filter(|p| p.state != PacketState::Sent)
                .count();
            if unsent > 0 {
                if self.ring.slots_behind_writer(idx) < TRICKLE_WINDOW {
                    break;
                }
                self.stats.trickle_expired_packets += unsent as u64;
                tracing::warn!(
                    block = ?slot.block_index,
                    unsent,
                    "block left the trickle window unsent"
                );
            }
            self.ring.advance_send();
        }
    }

    /// Stream bytes still needed to complete the block under the writer.
    pub fn block_bytes_remaining(&self) -> usize {
        let slot = self.ring.write_slot();
        let len = slot.packet_length;
        let filled = self.packet_index * len + slot.packets[self.packet_index].fill;
        (slot.data_packets * len).saturating_sub(filled)
    }

    // ─── Retransmissions ────────────────────────────────────────────────

    /// Resend whatever `req` names that is still in the ring. Returns the
    /// number of packets sent, duplicates included.
    pub fn handle_retransmission_request(
        &mut self,
        req: &RetransmissionRequest,
        now: Instant,
    ) -> usize {
        if !self.encoding.encoding_flags.retransmissions_enabled() {
            self.responder.ignore(req);
            return 0;
        }
        let dup = DuplicationContext {
            setting: self.encoding.encoding_flags.duplication(),
            profile: self.encoding.profile,
            shift_level: self.link.overrides.shift_level,
        };
        let targets = self
            .responder
            .resolve(req, &self.ring, self.block_index, &dup, now);
        let mut sent = 0;
        for t in targets {
            let kind = if t.duplicate {
                SendKind::Duplicate
            } else {
                SendKind::Retransmission
            };
            if self.send_packet(t.slot, t.packet, kind, false, now) {
                sent += 1;
            }
        }
        sent
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    fn send_packet(
        &mut self,
        idx: RingIndex,
        packet: usize,
        kind: SendKind,
        can_start_tx: bool,
        now: Instant,
    ) -> bool {
        let slot = self.ring.slot_mut(idx);
        let Some(block_index) = slot.block_index else {
            return false;
        };
        let len = slot.packet_length;
        let buffer = &mut slot.packets[packet];
        if buffer.state == PacketState::Empty {
            return false;
        }
        if self.paused {
            self.stats.paused_drops += 1;
            return false;
        }
        buffer.state = PacketState::Sent;

        let retransmission = kind != SendKind::Original;
        let mut packet_flags = Component::Video as u8 | flags::HEADERS_ONLY_CRC;
        if retransmission {
            packet_flags |= flags::RETRANSMITTED;
        }
        if can_start_tx {
            packet_flags |= flags::CAN_START_TX;
        }

        let frame = buffer.frame_mut(len);
        set_frame_flags(frame, packet_flags);
        set_frame_stream_index(frame, compose_stream_index(STREAM_ID_VIDEO, self.seq.next()));
        if let Some(mut video) = VideoBlockHeader::peek(frame) {
            video.last_request_id = self.responder.last_request_id();
            video.fec_time_us = self.stats.encode_time_hint();
            video.write_to(frame);
        }
        seal(frame);

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        match kind {
            SendKind::Original => self.stats.original_packets += 1,
            SendKind::Retransmission => self.stats.retransmitted_packets += 1,
            SendKind::Duplicate => self.stats.duplicated_packets += 1,
        }

        let ctx = DispatchContext {
            block_index,
            packet_index: packet as u8,
            retransmission,
        };
        if self.faults.should_drop(&ctx, now) {
            self.stats.fault_drops += 1;
            return true;
        }
        self.output_rate.record(frame.len());
        if !self.radio.send(true, frame, retransmission, now) {
            self.stats.dispatch_failures += 1;
        }
        true
    }

    // ─── Control ────────────────────────────────────────────────────────

    /// Mark the link configuration as changed; applied at the next block
    /// boundary.
    pub fn signal_encoding_change(&mut self) {
        self.gate.signal_change();
    }

    /// Apply a local encoding update from the link-quality estimator.
    pub fn apply_encoding_update(&mut self, update: &EncodingUpdate) {
        let overrides = &mut self.link.overrides;
        overrides.profile = update.profile;
        overrides.data_packets = update.data_packets as usize;
        overrides.parity_packets = update.parity_packets as usize;
        overrides.shift_level = update.shift_level;
        overrides.lower_bitrate = update.lower_bitrate;
        tracing::debug!(
            profile = update.profile,
            data = update.data_packets,
            parity = update.parity_packets,
            shift = update.shift_level,
            "encoding update received"
        );
        if update.keyframe_interval > 0 {
            self.set_keyframe_interval(update.keyframe_interval as u32);
        }
        self.gate.signal_change();
    }

    /// Request a new keyframe interval (frames). Returns the clamped value.
    pub fn set_keyframe_interval(&mut self, frames: u32) -> u32 {
        self.frames.set_keyframe_interval(frames)
    }

    /// Keyframe commands for the encoder, oldest first.
    pub fn take_keyframe_command(&mut self) -> Option<KeyframeCommand> {
        self.keyframe_commands.pop_front()
    }

    pub fn pause(&mut self) {
        if !self.paused {
            tracing::info!(block = self.block_index, "video transmission paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            tracing::info!(block = self.block_index, "video transmission resumed");
            self.paused = false;
        }
    }

    // ─── Housekeeping ───────────────────────────────────────────────────

    /// Evict request history and close the encode-time and request windows.
    pub fn on_slow_tick(&mut self, now: Instant) {
        self.responder.evict(now);
        self.responder.stats_mut().roll_window();
        self.stats.roll_encode_window();
    }

    /// Sample the bitrate meters.
    pub fn on_fast_tick(&mut self, now: Instant) {
        self.input_rate.tick(now);
        self.output_rate.tick(now);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            vehicle_id: self.config.vehicle_id,
            block_index: self.block_index,
            profile: self.encoding.profile,
            data_packets: self.encoding.data_packets as u8,
            parity_packets: self.encoding.parity_packets as u8,
            packet_length: self.encoding.packet_length as u16,
            keyframe_interval: self.frames.keyframe_interval(),
            paused: self.paused,
            input_bps: self.input_rate.bps(),
            output_bps: self.output_rate.bps(),
            tx: self.stats.clone(),
            video: self.frames.stats().clone(),
            retransmissions: self.responder.stats().clone(),
            interfaces: self.radio.interface_stats(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{profile_id, VideoProfile};
    use crate::radio::RadioConfig;
    use crate::wire::DuplicationSetting;

    fn scheduler(k: usize, m: usize, len: usize) -> Scheduler {
        let profile = VideoProfile::new(
            profile_id::USER,
            "test",
            1_000_000,
            (k, m, len),
            DuplicationSetting::Off,
        );
        let link = LinkState::new(vec![profile], profile_id::USER).unwrap();
        Scheduler::new(
            SchedulerConfig {
                ring_depth: 8,
                ..Default::default()
            },
            link,
            RadioDispatcher::new(RadioConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn encoding_change_waits_for_block_boundary() {
        let now = Instant::now();
        let mut s = scheduler(4, 1, 10);
        s.feed(&[0u8; 20], now);
        s.link_mut().overrides.data_packets = 2;
        s.link_mut().overrides.parity_packets = 2;
        s.signal_encoding_change();
        assert_eq!(s.ring.write_slot().data_packets, 4);

        s.feed(&[0u8; 20], now);
        assert_eq!(s.current_block(), 1);
        assert_eq!(s.ring.write_slot().data_packets, 2);
        assert_eq!(s.ring.write_slot().parity_packets, 2);
        assert_eq!(s.stats().encoding_changes, 1);

        let idx = s.has_block_ready_to_send().unwrap();
        assert_eq!(s.ring.slot(idx).total_packets(), 5);
    }

    #[test]
    fn partial_feed_keeps_packet_open() {
        let now = Instant::now();
        let mut s = scheduler(4, 1, 100);
        s.feed(&[1u8; 99], now);
        assert_eq!(s.ring.write_slot().packets[0].state, PacketState::Empty);
        s.feed(&[1u8; 1], now);
        assert_eq!(s.ring.write_slot().packets[0].state, PacketState::Read);
    }

    #[test]
    fn block_completes_with_parity() {
        let now = Instant::now();
        let mut s = scheduler(4, 2, 50);
        s.feed(&[9u8; 200], now);
        assert_eq!(s.current_block(), 1);
        let idx = s.has_block_ready_to_send().unwrap();
        let slot = s.ring.slot(idx);
        assert!(slot.packets[..6].iter().all(|p| p.state == PacketState::Read));
        let header = VideoBlockHeader::peek(slot.packets[5].frame(50)).unwrap();
        assert_eq!(header.packet_index, 5);
        assert_eq!(header.block_index, 0);
        assert_eq!(s.stats().parity_packets_generated, 2);
    }

    #[test]
    fn trickle_counts_ready_packets() {
        let now = Instant::now();
        let mut s = scheduler(4, 1, 10);
        s.feed(&[0u8; 30], now);
        assert_eq!(s.has_packets_ready_to_send(), 3);
        assert_eq!(s.send_packets_ready_to_send(2, now), 2);
        assert_eq!(s.has_packets_ready_to_send(), 1);
    }

    #[test]
    fn trickle_counts_blocks_that_leave_the_window() {
        let now = Instant::now();
        let mut s = scheduler(2, 1, 10);
        s.feed(&[0u8; 80], now);
        assert_eq!(s.send_packets_ready_to_send(100, now), 6);
        assert_eq!(s.stats().trickle_expired_packets, 6);
        assert_eq!(s.send_packets_ready_to_send(100, now), 0);
        assert_eq!(s.stats().trickle_expired_packets, 6);
    }

    #[test]
    fn bytes_remaining_tracks_the_open_block() {
        let now = Instant::now();
        let mut s = scheduler(4, 1, 10);
        assert_eq!(s.block_bytes_remaining(), 40);
        s.feed(&[0u8; 13], now);
        assert_eq!(s.block_bytes_remaining(), 27);
        s.feed(&[0u8; 27], now);
        assert_eq!(s.current_block(), 1);
        assert_eq!(s.block_bytes_remaining(), 40);
    }

    #[test]
    fn lower_bitrate_bit_is_constant_within_a_block() {
        let now = Instant::now();
        let mut s = scheduler(4, 1, 10);
        s.feed(&[0u8; 10], now);
        s.link_mut().overrides.lower_bitrate = true;
        s.feed(&[0u8; 30], now);

        let idx = s.has_block_ready_to_send().unwrap();
        let slot = s.ring.slot(idx);
        for p in &slot.packets[..5] {
            let header = VideoBlockHeader::peek(p.frame(10)).unwrap();
            assert!(!header.encoding_flags.on_lower_bitrate());
        }
        let next = VideoBlockHeader::peek(s.ring.write_slot().packets[0].frame(10)).unwrap();
        assert!(next.encoding_flags.on_lower_bitrate());
    }

    #[test]
    fn paused_sends_nothing() {
        let now = Instant::now();
        let mut s = scheduler(2, 1, 10);
        s.feed(&[0u8; 20], now);
        s.pause();
        assert_eq!(s.send_first_complete_block(true, now), 0);
        assert_eq!(s.stats().paused_drops, 3);
        s.resume();
        assert!(!s.is_paused());
    }

    #[test]
    fn retransmissions_disabled_ignores_requests() {
        let now = Instant::now();
        let mut s = scheduler(2, 1, 10);
        s.encoding.encoding_flags = s.encoding.encoding_flags.with_retransmissions(false);
        let req = RetransmissionRequest {
            request_id: None,
            stream_id: 0,
            packets: vec![],
        };
        assert_eq!(s.handle_retransmission_request(&req, now), 0);
        assert_eq!(s.responder().stats().requests_ignored, 1);
    }
}
