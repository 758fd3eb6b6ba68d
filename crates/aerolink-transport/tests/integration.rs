//! # Integration tests: Scheduler → radio dispatch → wire
//!
//! The scheduler runs against recording radio interfaces; every frame that
//! reaches the "air" is captured and decoded again. No real I/O.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use aerolink_transport::codec::ErasureCoder;
use aerolink_transport::fault::ScriptedFaults;
use aerolink_transport::gate::{LinkState, VideoProfile};
use aerolink_transport::ipc::InProcessChannel;
use aerolink_transport::pool::PacketState;
use aerolink_transport::radio::{Capabilities, Datarate, RadioConfig, RadioDispatcher, RadioInterface};
use aerolink_transport::runtime::{EventSource, LoopConfig, Readiness, SendMode, TxLoop};
use aerolink_transport::sender::{ClockSyncMode, Scheduler, SchedulerConfig};
use aerolink_transport::wire::{
    validate, DuplicationSetting, EncodingUpdate, PacketHeader, RequestedPacket,
    RetransmissionRequest, VideoBlockHeader, STREAM_ID_VIDEO, STREAM_SEQ_MASK, VIDEO_HEADERS_LEN,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

type Air = Rc<RefCell<Vec<Vec<u8>>>>;
type Inbox = Rc<RefCell<VecDeque<Bytes>>>;

struct RecordingRadio {
    name: String,
    fail: bool,
    air: Air,
    inbox: Inbox,
}

impl RadioInterface for RecordingRadio {
    fn name(&self) -> &str {
        &self.name
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }
    fn is_open_for_write(&self) -> bool {
        true
    }
    fn is_open_for_read(&self) -> bool {
        true
    }
    fn supports_frequency(&self, _frequency_khz: u32) -> bool {
        true
    }
    fn set_frequency(&mut self, _frequency_khz: u32) -> anyhow::Result<()> {
        Ok(())
    }
    fn write(&mut self, frame: &[u8], _datarate: Datarate) -> anyhow::Result<usize> {
        if self.fail {
            anyhow::bail!("driver rejected frame");
        }
        self.air.borrow_mut().push(frame.to_vec());
        Ok(frame.len())
    }
    fn read(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.inbox.borrow_mut().pop_front())
    }
}

struct Harness {
    scheduler: Scheduler,
    air: Air,
    inbox: Inbox,
}

fn profile(k: usize, m: usize, len: usize, dup: DuplicationSetting) -> VideoProfile {
    VideoProfile::new(2, "test", 2_000_000, (k, m, len), dup)
}

fn harness_with(profiles: Vec<VideoProfile>, config: SchedulerConfig) -> Harness {
    let air: Air = Rc::default();
    let inbox: Inbox = Rc::default();
    let mut radio = RadioDispatcher::new(RadioConfig::default());
    radio.add_interface(Box::new(RecordingRadio {
        name: "wlan0".into(),
        fail: false,
        air: air.clone(),
        inbox: inbox.clone(),
    }));
    let initial = profiles[0].id;
    let link = LinkState::new(profiles, initial).unwrap();
    Harness {
        scheduler: Scheduler::new(config, link, radio).unwrap(),
        air,
        inbox,
    }
}

fn harness(k: usize, m: usize, len: usize, ring_depth: usize) -> Harness {
    harness_with(
        vec![profile(k, m, len, DuplicationSetting::Off)],
        SchedulerConfig {
            ring_depth,
            ..Default::default()
        },
    )
}

fn headers(frame: &[u8]) -> (PacketHeader, VideoBlockHeader) {
    (
        PacketHeader::peek(frame).unwrap(),
        VideoBlockHeader::peek(frame).unwrap(),
    )
}

fn stream(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn request(packets: &[(u32, u8)]) -> RetransmissionRequest {
    RetransmissionRequest {
        request_id: Some(77),
        stream_id: 0,
        packets: packets
            .iter()
            .map(|&(block_index, packet_index)| RequestedPacket {
                block_index,
                packet_index,
                repeat_count: 0,
            })
            .collect(),
    }
}

// ─── Block Formation ────────────────────────────────────────────────────────

#[test]
fn one_block_from_thousand_bytes() {
    let now = Instant::now();
    let mut h = harness(8, 2, 100, 16);
    let data = stream(1000);

    h.scheduler.feed(&data[..799], now);
    assert!(h.scheduler.has_block_ready_to_send().is_none());
    h.scheduler.feed(&data[799..800], now);
    assert!(h.scheduler.has_block_ready_to_send().is_some());
    h.scheduler.feed(&data[800..], now);

    assert_eq!(h.scheduler.send_first_complete_block(true, now), 10);
    assert!(h.scheduler.has_block_ready_to_send().is_none());

    let air = h.air.borrow();
    assert_eq!(air.len(), 10);
    for (i, frame) in air.iter().enumerate() {
        assert!(validate(frame));
        let (ph, vh) = headers(frame);
        assert_eq!(frame.len(), VIDEO_HEADERS_LEN + 100);
        assert_eq!(ph.total_length as usize, frame.len());
        assert_eq!(ph.stream_id(), STREAM_ID_VIDEO);
        assert_eq!(ph.stream_seq(), i as u32);
        assert_eq!(vh.block_index, 0);
        assert_eq!(vh.packet_index, i as u8);
        assert_eq!((vh.data_packets, vh.parity_packets), (8, 2));
        assert_eq!(ph.can_start_tx(), i == 0);
        assert!(!ph.is_retransmitted());
        if i < 8 {
            assert_eq!(&frame[VIDEO_HEADERS_LEN..], &data[i * 100..(i + 1) * 100]);
        }
    }

    // Block 1 holds the remaining two data packets.
    let write = h.scheduler.ring().write_slot();
    assert_eq!(write.block_index, Some(1));
    assert_eq!(write.packets[1].state, PacketState::Read);
    assert_eq!(write.packets[2].state, PacketState::Empty);
}

#[test]
fn receiver_recovers_lost_data_from_parity() {
    let now = Instant::now();
    let (k, m, len) = (6, 3, 64);
    let mut h = harness(k, m, len, 16);
    let data = stream(k * len);
    h.scheduler.feed(&data, now);
    h.scheduler.send_complete_blocks(now);

    let air = h.air.borrow();
    assert_eq!(air.len(), k + m);
    let payloads: Vec<Vec<u8>> = air.iter().map(|f| f[VIDEO_HEADERS_LEN..].to_vec()).collect();

    let erased = [1usize, 4, 5];
    let mut shards: Vec<Vec<u8>> = payloads[..k].to_vec();
    for &e in &erased {
        shards[e] = vec![0; len];
    }
    let parity_ids = [0usize, 1, 2];
    let parity: Vec<&Vec<u8>> = parity_ids.iter().map(|&p| &payloads[k + p]).collect();
    ErasureCoder::new(k, m)
        .unwrap()
        .decode(len, &mut shards, &parity, &parity_ids, &erased)
        .unwrap();
    assert_eq!(shards.concat(), data);
}

#[test]
fn advanced_clock_sync_marks_last_packet_of_burst() {
    let now = Instant::now();
    let mut h = harness_with(
        vec![profile(2, 1, 10, DuplicationSetting::Off)],
        SchedulerConfig {
            ring_depth: 16,
            clock_sync: ClockSyncMode::Advanced,
            ..Default::default()
        },
    );
    h.scheduler.feed(&stream(60), now);
    assert_eq!(h.scheduler.send_complete_blocks(now), 9);

    let flagged: Vec<usize> = h
        .air
        .borrow()
        .iter()
        .enumerate()
        .filter(|(_, f)| headers(f).0.can_start_tx())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flagged, vec![8]);
}

#[test]
fn trickle_mode_sends_packets_as_they_fill() {
    let now = Instant::now();
    let mut h = harness(4, 1, 50, 16);
    h.scheduler.feed(&stream(120), now);
    assert_eq!(h.scheduler.has_packets_ready_to_send(), 2);
    assert_eq!(h.scheduler.send_packets_ready_to_send(16, now), 2);
    h.scheduler.feed(&stream(80), now);
    assert_eq!(h.scheduler.send_packets_ready_to_send(16, now), 3);

    let indices: Vec<u8> = h.air.borrow().iter().map(|f| headers(f).1.packet_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[test]
fn advanced_trickle_marks_only_the_last_packet_of_each_call() {
    let now = Instant::now();
    let mut h = harness_with(
        vec![profile(2, 1, 10, DuplicationSetting::Off)],
        SchedulerConfig {
            ring_depth: 16,
            clock_sync: ClockSyncMode::Advanced,
            ..Default::default()
        },
    );
    h.scheduler.feed(&stream(40), now);
    assert_eq!(h.scheduler.send_packets_ready_to_send(16, now), 6);

    // The batch limit cuts block 2 after its second packet.
    h.scheduler.feed(&stream(20), now);
    assert_eq!(h.scheduler.send_packets_ready_to_send(2, now), 2);

    let flagged: Vec<usize> = h
        .air
        .borrow()
        .iter()
        .enumerate()
        .filter(|(_, f)| headers(f).0.can_start_tx())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flagged, vec![5, 7]);
}

// ─── Ring overrun ───────────────────────────────────────────────────────────

#[test]
fn overrun_recycles_only_the_oldest_unsent_block() {
    let now = Instant::now();
    let depth = 4;
    let mut h = harness(2, 1, 10, depth);

    // depth + 1 blocks before anything is sent.
    h.scheduler.feed(&stream(20 * (depth + 1)), now);
    assert_eq!(h.scheduler.stats().blocks_completed, 5);
    assert_eq!(h.scheduler.stats().ring_overruns, 2);
    assert_eq!(h.scheduler.ring().ready_blocks(), depth - 1);

    assert_eq!(h.scheduler.send_complete_blocks(now), 9);
    let blocks: Vec<u32> = h.air.borrow().iter().map(|f| headers(f).1.block_index).collect();
    assert_eq!(blocks, vec![2, 2, 2, 3, 3, 3, 4, 4, 4]);

    // The send cursor keeps working after the overrun.
    h.scheduler.feed(&stream(20), now);
    assert_eq!(h.scheduler.send_complete_blocks(now), 3);
    assert_eq!(headers(&h.air.borrow()[9]).1.block_index, 5);
    assert_eq!(h.scheduler.stats().ring_overruns, 2);
}

// ─── Retransmissions ────────────────────────────────────────────────────────

#[test]
fn recycled_block_is_not_resent() {
    let now = Instant::now();
    let depth = 4;
    let mut h = harness(2, 1, 10, depth);
    h.scheduler.feed(&stream(20), now);
    h.scheduler.send_complete_blocks(now);

    let req = request(&[(0, 0)]);
    assert_eq!(h.scheduler.handle_retransmission_request(&req, now), 1);

    // Advance the writer by `depth` more blocks.
    for _ in 0..depth {
        h.scheduler.feed(&stream(20), now);
        h.scheduler.send_complete_blocks(now);
    }
    assert_eq!(h.scheduler.current_block(), 1 + depth as u32);
    let sent_before = h.air.borrow().len();
    assert_eq!(h.scheduler.handle_retransmission_request(&req, now), 0);
    assert_eq!(h.air.borrow().len(), sent_before);
    assert!(h.scheduler.responder().stats().segments_stale >= 1);
}

#[test]
fn sequence_numbers_are_contiguous_across_retransmissions() {
    let now = Instant::now();
    let mut h = harness(3, 1, 20, 16);
    h.scheduler.feed(&stream(60), now);
    h.scheduler.send_complete_blocks(now);
    h.scheduler
        .handle_retransmission_request(&request(&[(0, 1), (0, 3)]), now);
    h.scheduler.feed(&stream(60), now);
    h.scheduler.send_complete_blocks(now);

    let air = h.air.borrow();
    assert_eq!(air.len(), 10);
    for pair in air.windows(2) {
        let a = headers(&pair[0]).0.stream_seq();
        let b = headers(&pair[1]).0.stream_seq();
        assert_eq!(b, (a + 1) & STREAM_SEQ_MASK);
    }
    let (ph, vh) = headers(&air[4]);
    assert!(ph.is_retransmitted());
    assert!(!ph.can_start_tx());
    assert_eq!((vh.block_index, vh.packet_index), (0, 1));
    assert_eq!(vh.last_request_id, 77);
}

#[test]
fn repeated_request_is_deduplicated_in_history() {
    let now = Instant::now();
    let mut h = harness(3, 1, 20, 16);
    h.scheduler.feed(&stream(60), now);
    h.scheduler.send_complete_blocks(now);

    let req = request(&[(0, 2)]);
    assert_eq!(h.scheduler.handle_retransmission_request(&req, now), 1);
    assert_eq!(
        h.scheduler
            .handle_retransmission_request(&req, now + Duration::from_millis(30)),
        1
    );

    let history = h.scheduler.responder().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history.get(0, 2).unwrap().repeat_count, 1);
    let stats = h.scheduler.responder().stats();
    assert_eq!(stats.segments_unique, 1);
    assert_eq!(stats.segments_retried, 1);
}

#[test]
fn request_for_empty_packet_sends_nothing() {
    let now = Instant::now();
    let mut h = harness(4, 2, 30, 16);
    h.scheduler.feed(&stream(45), now);

    let sent = h.scheduler.handle_retransmission_request(&request(&[(0, 3), (0, 5)]), now);
    assert_eq!(sent, 0);
    assert!(h.air.borrow().is_empty());
    let slot = h.scheduler.ring().write_slot();
    assert_eq!(slot.packets[0].state, PacketState::Read);
    assert_eq!(slot.packets[1].state, PacketState::Empty);
    assert_eq!(slot.packets[3].state, PacketState::Empty);
    assert_eq!(slot.packets[1].fill, 15);
}

#[test]
fn full_duplication_doubles_every_resend() {
    let now = Instant::now();
    let mut h = harness_with(
        vec![profile(2, 1, 10, DuplicationSetting::Percent(10))],
        SchedulerConfig {
            ring_depth: 8,
            ..Default::default()
        },
    );
    h.scheduler.feed(&stream(20), now);
    h.scheduler.send_complete_blocks(now);
    assert_eq!(
        h.scheduler
            .handle_retransmission_request(&request(&[(0, 0), (0, 1)]), now),
        4
    );
    assert_eq!(h.scheduler.stats().duplicated_packets, 2);
    assert_eq!(h.air.borrow().len(), 7);
}

#[test]
fn disabled_retransmissions_ignore_requests() {
    let now = Instant::now();
    let mut p = profile(2, 1, 10, DuplicationSetting::Off);
    p.encoding_flags = p.encoding_flags.with_retransmissions(false);
    let mut h = harness_with(vec![p], SchedulerConfig::default());
    h.scheduler.feed(&stream(20), now);
    h.scheduler.send_complete_blocks(now);
    assert_eq!(
        h.scheduler
            .handle_retransmission_request(&request(&[(0, 0)]), now),
        0
    );
    assert_eq!(h.scheduler.responder().stats().requests_ignored, 1);
}

// ─── Encoding Changes ───────────────────────────────────────────────────────

#[test]
fn blocks_stay_homogeneous_across_encoding_changes() {
    let now = Instant::now();
    let mut alt = profile(3, 2, 40, DuplicationSetting::Off);
    alt.id = 4;
    let mut h = harness_with(
        vec![profile(4, 1, 25, DuplicationSetting::Off), alt],
        SchedulerConfig {
            ring_depth: 32,
            ..Default::default()
        },
    );

    let data = stream(3000);
    for (i, chunk) in data.chunks(37).enumerate() {
        if i == 5 {
            h.scheduler.apply_encoding_update(&EncodingUpdate {
                profile: 4,
                ..Default::default()
            });
        }
        if i == 30 {
            h.scheduler.apply_encoding_update(&EncodingUpdate {
                profile: 2,
                data_packets: 5,
                parity_packets: 0,
                ..Default::default()
            });
        }
        h.scheduler.feed(chunk, now);
        h.scheduler.send_complete_blocks(now);
    }

    let air = h.air.borrow();
    let mut by_block: std::collections::BTreeMap<u32, Vec<VideoBlockHeader>> = Default::default();
    for frame in air.iter() {
        let vh = headers(frame).1;
        assert_eq!(frame.len(), VIDEO_HEADERS_LEN + vh.packet_length as usize);
        by_block.entry(vh.block_index).or_default().push(vh);
    }
    let shapes: std::collections::BTreeSet<(u8, u8, u16, u8)> = by_block
        .values()
        .map(|hs| {
            let first = hs[0];
            for h in hs {
                assert_eq!(
                    (h.data_packets, h.parity_packets, h.packet_length, h.profile),
                    (first.data_packets, first.parity_packets, first.packet_length, first.profile)
                );
            }
            assert_eq!(hs.len(), first.total_packets());
            (first.data_packets, first.parity_packets, first.packet_length, first.profile)
        })
        .collect();
    assert_eq!(shapes.len(), 3);
    assert_eq!(h.scheduler.stats().encoding_changes, 2);
}

// ─── Faults and Failures ────────────────────────────────────────────────────

#[test]
fn fault_drop_leaves_sequence_gap_and_is_recoverable() {
    let now = Instant::now();
    let h = harness(3, 1, 20, 16);
    let mut scheduler = h.scheduler.with_faults(Box::new(ScriptedFaults::new([(0, 1)])));
    scheduler.feed(&stream(60), now);
    scheduler.send_complete_blocks(now);

    {
        let air = h.air.borrow();
        let seqs: Vec<u32> = air.iter().map(|f| headers(f).0.stream_seq()).collect();
        assert_eq!(seqs, vec![0, 2, 3]);
    }
    assert_eq!(scheduler.stats().fault_drops, 1);

    assert_eq!(scheduler.handle_retransmission_request(&request(&[(0, 1)]), now), 1);
    let air = h.air.borrow();
    let (ph, vh) = headers(air.last().unwrap());
    assert_eq!(vh.packet_index, 1);
    assert_eq!(ph.stream_seq(), 4);
    assert!(ph.is_retransmitted());
}

#[test]
fn failing_interface_does_not_block_others() {
    let now = Instant::now();
    let air: Air = Rc::default();
    let mut radio = RadioDispatcher::new(RadioConfig::default());
    radio.add_interface(Box::new(RecordingRadio {
        name: "broken".into(),
        fail: true,
        air: Rc::default(),
        inbox: Rc::default(),
    }));
    radio.add_interface(Box::new(RecordingRadio {
        name: "good".into(),
        fail: false,
        air: air.clone(),
        inbox: Rc::default(),
    }));
    let link = LinkState::new(vec![profile(2, 1, 10, DuplicationSetting::Off)], 2).unwrap();
    let mut s = Scheduler::new(SchedulerConfig::default(), link, radio).unwrap();
    s.feed(&stream(20), now);
    s.send_complete_blocks(now);

    assert_eq!(air.borrow().len(), 3);
    let stats = s.radio().interface_stats();
    assert_eq!(stats[0].write_failures, 3);
    assert_eq!(stats[1].frames_written, 3);
    assert_eq!(s.stats().dispatch_failures, 0);
}

// ─── Transmit Loop ──────────────────────────────────────────────────────────

struct Idle;

impl EventSource for Idle {
    fn wait(&mut self, _timeout: Duration) -> anyhow::Result<Readiness> {
        Ok(Readiness::default())
    }
}

#[test]
fn loop_answers_requests_arriving_over_the_air() {
    let h = harness(2, 1, 10, 16);
    let inbox = h.inbox.clone();
    let air = h.air.clone();
    let (ours, _theirs) = InProcessChannel::pair(8);
    let mut tx = TxLoop::new(
        h.scheduler,
        LoopConfig::default(),
        SendMode::Blocks,
        Box::new(Idle),
        Box::new(std::io::Cursor::new(stream(20))),
        Box::new(ours),
    );
    let now = Instant::now();
    tx.step(
        Readiness {
            stream: true,
            control: false,
        },
        now,
    )
    .unwrap();
    assert_eq!(air.borrow().len(), 3);

    inbox
        .borrow_mut()
        .push_back(Bytes::from(request(&[(0, 2)]).to_packet(9, 0).to_vec()));
    tx.step(Readiness::default(), now).unwrap();
    assert_eq!(tx.stats().air_requests, 1);
    assert_eq!(air.borrow().len(), 4);
    assert!(headers(&air.borrow()[3]).0.is_retransmitted());
}

#[test]
fn trickle_loop_puts_every_block_on_the_air() {
    let h = harness(4, 1, 100, 16);
    let air = h.air.clone();
    let (ours, _theirs) = InProcessChannel::pair(8);
    let mut tx = TxLoop::new(
        h.scheduler,
        LoopConfig::default(),
        SendMode::Trickle { max_packets: 4 },
        Box::new(Idle),
        // One read would otherwise complete 20 blocks at once.
        Box::new(std::io::Cursor::new(stream(8000))),
        Box::new(ours),
    );
    let ready = Readiness {
        stream: true,
        control: false,
    };
    let now = Instant::now();
    for _ in 0..200 {
        tx.step(ready, now).unwrap();
        if tx.input_closed() && tx.scheduler().has_packets_ready_to_send() == 0 {
            break;
        }
    }

    let stats = tx.scheduler().stats();
    assert_eq!(stats.blocks_completed, 20);
    assert_eq!(stats.trickle_expired_packets, 0);
    assert_eq!(stats.ring_overruns, 0);

    let mut on_air: Vec<(u32, u8)> = air
        .borrow()
        .iter()
        .map(|f| {
            let (_, video) = headers(f);
            (video.block_index, video.packet_index)
        })
        .collect();
    on_air.sort_unstable();
    on_air.dedup();
    assert_eq!(on_air.len(), 20 * 5);
    assert_eq!(on_air.last(), Some(&(19, 4)));
}
