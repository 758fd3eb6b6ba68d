//! # Retransmission Responder
//!
//! Answers retransmission requests from the ground station out of the
//! transmit ring.
//!
//! The receiver decides what is missing and names `(block, packet)` pairs;
//! the vehicle side only has to find them. Requests for packets that have
//! left the ring are dropped silently: by then the receiver has moved on.
//!
//! ## Duplication
//!
//! On weak links a retransmission may itself be lost. [`DuplicationPolicy`]
//! sends an extra copy of every Nth resent packet, with N taken from the
//! profile's duplication percentage, or, in auto mode, of every resent
//! packet while the link is on the lowest-quality profile and has shifted
//! down far enough.

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;

use crate::gate::profile_id;
use crate::pool::{BlockRing, PacketState, RingIndex};
use crate::stats::RetransmissionStats;
use crate::wire::{DuplicationSetting, RequestedPacket, RetransmissionRequest};

pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_millis(500);
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

// ─── Request History ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub block_index: u32,
    pub packet_index: u8,
    pub received_at: Instant,
    pub repeat_count: u32,
}

/// Recently requested packets, oldest first.
pub struct RequestHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    window: Duration,
}

impl RequestHistory {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RequestHistory {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Record a request. Returns `true` if the packet was not already in the
    /// history; a repeat bumps the existing entry's count instead.
    pub fn record(&mut self, packet: &RequestedPacket, now: Instant) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| {
            e.block_index == packet.block_index && e.packet_index == packet.packet_index
        }) {
            entry.repeat_count += 1;
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            block_index: packet.block_index,
            packet_index: packet.packet_index,
            received_at: now,
            repeat_count: 0,
        });
        true
    }

    /// Drop entries older than the window.
    pub fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.received_at) <= self.window {
                break;
            }
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn get(&self, block_index: u32, packet_index: u8) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .find(|e| e.block_index == block_index && e.packet_index == packet_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Duplication Policy ─────────────────────────────────────────────────────

/// Link facts the duplication decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicationContext {
    pub setting: DuplicationSetting,
    pub profile: u8,
    pub shift_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicationPolicy {
    /// For each percentage step 1..=10, duplicate once the counter exceeds
    /// this many retransmissions. Index 0 is unused.
    pub interval_by_percent: [u32; 11],
    pub auto_profile: u8,
    pub auto_min_shift: u8,
}

impl Default for DuplicationPolicy {
    fn default() -> Self {
        DuplicationPolicy {
            interval_by_percent: [0, 11, 6, 4, 3, 3, 2, 1, 1, 0, 0],
            auto_profile: profile_id::LQ,
            auto_min_shift: 2,
        }
    }
}

impl DuplicationPolicy {
    /// Decide for one resent packet. `counter` counts retransmissions since
    /// the last duplicate.
    pub fn should_duplicate(&self, ctx: &DuplicationContext, counter: &mut u32) -> bool {
        match ctx.setting {
            DuplicationSetting::Off => false,
            DuplicationSetting::Auto => {
                ctx.profile == self.auto_profile && ctx.shift_level >= self.auto_min_shift
            }
            DuplicationSetting::Percent(p) => {
                let interval = self.interval_by_percent[p.min(10) as usize];
                *counter += 1;
                if *counter > interval {
                    *counter = 0;
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ─── Responder ──────────────────────────────────────────────────────────────

/// One packet to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendTarget {
    pub slot: RingIndex,
    pub packet: usize,
    /// Extra copy requested by the duplication policy.
    pub duplicate: bool,
}

pub struct RetransmitResponder {
    history: RequestHistory,
    policy: DuplicationPolicy,
    duplication_counter: u32,
    stats: RetransmissionStats,
}

impl RetransmitResponder {
    pub fn new(window: Duration, capacity: usize, policy: DuplicationPolicy) -> Self {
        RetransmitResponder {
            history: RequestHistory::new(window, capacity),
            policy,
            duplication_counter: 0,
            stats: RetransmissionStats::default(),
        }
    }

    pub fn history(&self) -> &RequestHistory {
        &self.history
    }

    pub fn stats(&self) -> &RetransmissionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RetransmissionStats {
        &mut self.stats
    }

    /// Id of the last request that carried one, 0 if none.
    pub fn last_request_id(&self) -> u32 {
        self.stats.last_request_id
    }

    /// Count a request that arrived while retransmissions are disabled.
    pub fn ignore(&mut self, req: &RetransmissionRequest) {
        self.stats.requests_received += 1;
        self.stats.requests_ignored += 1;
        if let Some(id) = req.request_id {
            self.stats.last_request_id = id;
        }
    }

    pub fn evict(&mut self, now: Instant) {
        self.history.evict(now);
    }

    /// Work out which packets to resend for `req`, in request order.
    ///
    /// Does not touch the ring.
    pub fn resolve(
        &mut self,
        req: &RetransmissionRequest,
        ring: &BlockRing,
        current_block: u32,
        dup: &DuplicationContext,
        now: Instant,
    ) -> Vec<ResendTarget> {
        self.stats.requests_received += 1;
        self.stats.requests_in_window += 1;
        if let Some(id) = req.request_id {
            self.stats.last_request_id = id;
        }

        let mut targets = Vec::with_capacity(req.packets.len());
        for p in &req.packets {
            self.stats.segments_requested += 1;
            if self.history.record(p, now) {
                self.stats.segments_unique += 1;
            } else {
                self.stats.segments_retried += 1;
            }

            let Some(slot_idx) = ring.resolve(current_block, p.block_index) else {
                self.stats.segments_stale += 1;
                continue;
            };
            let slot = ring.slot(slot_idx);
            let packet = p.packet_index as usize;
            if packet >= slot.total_packets() || slot.packets[packet].state == PacketState::Empty {
                self.stats.segments_stale += 1;
                continue;
            }

            tracing::debug!(
                block = p.block_index,
                packet = p.packet_index,
                repeat = p.repeat_count,
                "resending packet"
            );
            targets.push(ResendTarget {
                slot: slot_idx,
                packet,
                duplicate: false,
            });
            self.stats.segments_resent += 1;
            if self
                .policy
                .should_duplicate(dup, &mut self.duplication_counter)
            {
                targets.push(ResendTarget {
                    slot: slot_idx,
                    packet,
                    duplicate: true,
                });
            }
        }
        targets
    }
}
