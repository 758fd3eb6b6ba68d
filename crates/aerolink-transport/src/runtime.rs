//! # Transmit Loop
//!
//! Single-threaded cooperative loop around a [`Scheduler`]. Each iteration:
//!
//! 1. Bounded wait on the stream input and the control channel.
//! 2. Read encoder output into the scheduler.
//! 3. Drain a bounded number of control messages, then any requests that
//!    arrived over the air.
//! 4. Send whole blocks or trickle ready packets.
//! 5. Housekeeping: history eviction, bitrate sampling, stall alarm, loop
//!    budget warning, statistics publishing.
//!
//! The shutdown flag is checked once per iteration; a partially filled
//! block is abandoned on exit.

use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use quanta::Instant;

use crate::ipc::{classify, ControlMessage, MessageChannel};
use crate::sender::{Scheduler, TRICKLE_WINDOW};
use crate::stats::{publish_snapshot, StatsSnapshot};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Send each block once it is complete.
    #[default]
    Blocks,
    /// Send ready packets as they appear, at most this many per iteration.
    Trickle { max_packets: usize },
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_timeout: Duration,
    /// Iterations taking longer than this are logged.
    pub iteration_budget: Duration,
    /// Input silence that raises the stall alarm.
    pub stall_threshold: Duration,
    pub housekeeping_interval: Duration,
    pub rate_interval: Duration,
    pub stats_interval: Duration,
    pub max_control_messages: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            poll_timeout: Duration::from_millis(10),
            iteration_budget: Duration::from_millis(20),
            stall_threshold: Duration::from_millis(2000),
            housekeeping_interval: Duration::from_millis(500),
            rate_interval: Duration::from_millis(100),
            stats_interval: Duration::from_millis(1000),
            max_control_messages: 16,
        }
    }
}

// ─── Boundaries ─────────────────────────────────────────────────────────────

/// Which sources have data after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub stream: bool,
    pub control: bool,
}

/// Multiplexed wait over the stream input and the control channel.
pub trait EventSource {
    fn wait(&mut self, timeout: Duration) -> anyhow::Result<Readiness>;
}

/// Encoder output. `Ok(None)` means nothing to read right now, `Ok(Some(0))`
/// end of stream.
pub trait StreamInput {
    fn read_chunk(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>>;
}

impl<R: Read> StreamInput for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        loop {
            match self.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ─── Loop ───────────────────────────────────────────────────────────────────

const READ_CHUNK: usize = 64 * 1024;
/// Reads per iteration before yielding to the rest of the loop.
const MAX_READS: usize = 8;
/// Complete blocks waiting for the trickle path before input reads pause.
const TRICKLE_BACKLOG: usize = TRICKLE_WINDOW - 1;

#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub iterations: u64,
    pub loop_overruns: u64,
    pub feed_stalls: u64,
    pub control_messages: u64,
    pub control_corrupt: u64,
    pub control_ignored: u64,
    pub control_errors: u64,
    pub air_requests: u64,
    pub keyframe_commands: u64,
}

pub struct TxLoop {
    scheduler: Scheduler,
    config: LoopConfig,
    send_mode: SendMode,
    events: Box<dyn EventSource>,
    input: Box<dyn StreamInput>,
    control: Box<dyn MessageChannel>,
    stats_path: Option<PathBuf>,
    stats: LoopStats,
    read_buf: Vec<u8>,
    started_at: Instant,
    last_housekeeping: Instant,
    last_rate: Instant,
    last_stats: Instant,
    stall_reported: bool,
    input_closed: bool,
}

impl TxLoop {
    pub fn new(
        scheduler: Scheduler,
        config: LoopConfig,
        send_mode: SendMode,
        events: Box<dyn EventSource>,
        input: Box<dyn StreamInput>,
        control: Box<dyn MessageChannel>,
    ) -> Self {
        let now = Instant::now();
        TxLoop {
            scheduler,
            config,
            send_mode,
            events,
            input,
            control,
            stats_path: None,
            stats: LoopStats::default(),
            read_buf: vec![0u8; READ_CHUNK],
            started_at: now,
            last_housekeeping: now,
            last_rate: now,
            last_stats: now,
            stall_reported: false,
            input_closed: false,
        }
    }

    /// Publish a JSON snapshot to `path` every stats interval.
    pub fn with_stats_path(mut self, path: PathBuf) -> Self {
        self.stats_path = Some(path);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn input_closed(&self) -> bool {
        self.input_closed
    }

    /// Run until `shutdown` is set or the stream input ends.
    pub fn run(&mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        tracing::info!(mode = ?self.send_mode, "transmit loop running");
        while !shutdown.load(Ordering::Relaxed) {
            self.iterate()?;
            if self.input_closed {
                tracing::info!("stream input closed, stopping");
                break;
            }
        }
        self.publish_stats();
        tracing::info!(
            iterations = self.stats.iterations,
            blocks = self.scheduler.stats().blocks_completed,
            packets = self.scheduler.stats().packets_sent,
            "transmit loop stopped"
        );
        Ok(())
    }

    /// One wait plus one round of work.
    pub fn iterate(&mut self) -> anyhow::Result<()> {
        let ready = self.events.wait(self.config.poll_timeout)?;
        self.step(ready, Instant::now())
    }

    /// One round of work for the given readiness.
    pub fn step(&mut self, ready: Readiness, now: Instant) -> anyhow::Result<()> {
        let started = Instant::now();
        self.stats.iterations += 1;

        if ready.stream && !self.input_closed {
            self.read_input(now)?;
        }
        if ready.control {
            self.drain_control(now);
        }
        self.poll_radio(now);
        self.send(now);
        self.forward_keyframe_commands();
        self.housekeeping(now);

        let elapsed = started.elapsed();
        if elapsed > self.config.iteration_budget {
            self.stats.loop_overruns += 1;
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.config.iteration_budget.as_millis() as u64,
                "loop took too long"
            );
        }
        Ok(())
    }

    fn read_input(&mut self, now: Instant) -> anyhow::Result<()> {
        for _ in 0..MAX_READS {
            let limit = match self.send_mode {
                SendMode::Blocks => self.read_buf.len(),
                // At most one block completes per read, and reading pauses
                // while the backlog would push unsent blocks out of the
                // trickle window.
                SendMode::Trickle { .. } => {
                    if !self.scheduler.is_paused()
                        && self.scheduler.ring().ready_blocks() >= TRICKLE_BACKLOG
                    {
                        break;
                    }
                    self.scheduler
                        .block_bytes_remaining()
                        .clamp(1, self.read_buf.len())
                }
            };
            match self.input.read_chunk(&mut self.read_buf[..limit])? {
                None => break,
                Some(0) => {
                    self.input_closed = true;
                    break;
                }
                Some(n) => self.scheduler.feed(&self.read_buf[..n], now),
            }
        }
        Ok(())
    }

    fn drain_control(&mut self, now: Instant) {
        for _ in 0..self.config.max_control_messages {
            let msg = match self.control.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    self.stats.control_errors += 1;
                    tracing::warn!(error = %e, "control channel receive failed");
                    break;
                }
            };
            self.stats.control_messages += 1;
            match classify(&msg) {
                ControlMessage::Retransmission(req) => {
                    self.scheduler.handle_retransmission_request(&req, now);
                }
                ControlMessage::EncodingUpdate(update) => {
                    self.scheduler.apply_encoding_update(&update);
                }
                ControlMessage::Corrupt => {
                    self.stats.control_corrupt += 1;
                    tracing::warn!(len = msg.len(), "dropped corrupt control message");
                }
                ControlMessage::Ignored => {
                    self.stats.control_ignored += 1;
                }
            }
        }
    }

    /// Retransmission requests that arrive over the air.
    fn poll_radio(&mut self, now: Instant) {
        for (iface, packet) in self.scheduler.radio_mut().read_all() {
            if let ControlMessage::Retransmission(req) = classify(&packet) {
                self.stats.air_requests += 1;
                tracing::debug!(interface = iface, packets = req.packets.len(), "air request");
                self.scheduler.handle_retransmission_request(&req, now);
            }
        }
    }

    fn send(&mut self, now: Instant) {
        match self.send_mode {
            SendMode::Blocks => {
                self.scheduler.send_complete_blocks(now);
            }
            SendMode::Trickle { max_packets } => {
                if self.scheduler.has_packets_ready_to_send() > 0 {
                    self.scheduler.send_packets_ready_to_send(max_packets, now);
                }
            }
        }
    }

    fn forward_keyframe_commands(&mut self) {
        while let Some(cmd) = self.scheduler.take_keyframe_command() {
            self.stats.keyframe_commands += 1;
            tracing::info!(interval = cmd.interval, "keyframe interval command");
            if let Err(e) = self.control.send(&cmd.to_packet()) {
                tracing::warn!(error = %e, "failed to forward keyframe command");
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        if now.duration_since(self.last_housekeeping) >= self.config.housekeeping_interval {
            self.scheduler.on_slow_tick(now);
            self.last_housekeeping = now;
        }
        if now.duration_since(self.last_rate) >= self.config.rate_interval {
            self.scheduler.on_fast_tick(now);
            self.last_rate = now;
        }

        let last_feed = self.scheduler.last_feed_at().unwrap_or(self.started_at);
        let silence = now.duration_since(last_feed);
        if silence > self.config.stall_threshold {
            if !self.stall_reported {
                self.stall_reported = true;
                self.stats.feed_stalls += 1;
                tracing::warn!(silence_ms = silence.as_millis() as u64, "video input stalled");
            }
        } else {
            self.stall_reported = false;
        }

        if now.duration_since(self.last_stats) >= self.config.stats_interval {
            self.publish_stats();
            self.last_stats = now;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            loop_overruns: self.stats.loop_overruns,
            feed_stalls: self.stats.feed_stalls,
            control_corrupt: self.stats.control_corrupt,
            ..self.scheduler.snapshot()
        }
    }

    fn publish_stats(&self) {
        let Some(path) = &self.stats_path else {
            return;
        };
        if let Err(e) = publish_snapshot(path, &self.snapshot()) {
            tracing::warn!(path = %path.display(), error = %e, "stats publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{LinkState, VideoProfile};
    use crate::ipc::InProcessChannel;
    use crate::radio::{RadioConfig, RadioDispatcher};
    use crate::sender::SchedulerConfig;
    use crate::wire::{DuplicationSetting, EncodingUpdate};
    use std::io::Cursor;

    struct NeverReady;

    impl EventSource for NeverReady {
        fn wait(&mut self, _timeout: Duration) -> anyhow::Result<Readiness> {
            Ok(Readiness::default())
        }
    }

    fn tx_loop(input: Vec<u8>) -> (TxLoop, InProcessChannel) {
        let profile = VideoProfile::new(2, "test", 1_000_000, (4, 1, 100), DuplicationSetting::Off);
        let link = LinkState::new(vec![profile], 2).unwrap();
        let scheduler = Scheduler::new(
            SchedulerConfig {
                ring_depth: 16,
                ..Default::default()
            },
            link,
            RadioDispatcher::new(RadioConfig::default()),
        )
        .unwrap();
        let (ours, theirs) = InProcessChannel::pair(16);
        let tx = TxLoop::new(
            scheduler,
            LoopConfig::default(),
            SendMode::Blocks,
            Box::new(NeverReady),
            Box::new(Cursor::new(input)),
            Box::new(ours),
        );
        (tx, theirs)
    }

    #[test]
    fn reads_input_and_sends_blocks() {
        let (mut tx, _peer) = tx_loop(vec![0u8; 1000]);
        let ready = Readiness {
            stream: true,
            control: false,
        };
        tx.step(ready, Instant::now()).unwrap();
        assert!(tx.input_closed());
        assert_eq!(tx.scheduler().stats().blocks_completed, 2);
        assert_eq!(tx.scheduler().stats().packets_sent, 10);
    }

    #[test]
    fn control_messages_are_classified() {
        let (mut tx, mut peer) = tx_loop(Vec::new());
        let update = EncodingUpdate {
            profile: 2,
            data_packets: 2,
            parity_packets: 2,
            ..Default::default()
        };
        peer.send(&update.to_packet()).unwrap();
        peer.send(&[0xAA; 40]).unwrap();
        let ready = Readiness {
            stream: false,
            control: true,
        };
        tx.step(ready, Instant::now()).unwrap();
        assert!(tx.scheduler().gate().is_pending());
        assert_eq!(tx.stats().control_messages, 2);
        assert_eq!(tx.stats().control_corrupt, 1);
    }

    #[test]
    fn stall_alarm_fires_once() {
        let (mut tx, _peer) = tx_loop(Vec::new());
        let t0 = Instant::now();
        let idle = Readiness::default();
        tx.step(idle, t0 + Duration::from_millis(2500)).unwrap();
        tx.step(idle, t0 + Duration::from_millis(3000)).unwrap();
        assert_eq!(tx.stats().feed_stalls, 1);
        assert_eq!(tx.snapshot().feed_stalls, 1);
    }

    #[test]
    fn run_stops_on_shutdown() {
        let (mut tx, _peer) = tx_loop(Vec::new());
        let shutdown = AtomicBool::new(true);
        tx.run(&shutdown).unwrap();
        assert_eq!(tx.stats().iterations, 0);
    }
}
