//! # Fault Injection
//!
//! Hooks that simulate air loss on the transmit side. The scheduler asks
//! the injector about every packet right before radio dispatch; a dropped
//! packet has already consumed its sequence number, so the receiver sees a
//! real gap.

use std::collections::HashSet;

use quanta::Instant;
use rand::rngs::SmallRng;
use rand::{RngExt, SeedableRng};

/// What the scheduler is about to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    pub block_index: u32,
    pub packet_index: u8,
    pub retransmission: bool,
}

pub trait FaultInjector {
    /// `true` to drop the packet instead of sending it.
    fn should_drop(&mut self, ctx: &DispatchContext, now: Instant) -> bool;
}

/// Never drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_drop(&mut self, _ctx: &DispatchContext, _now: Instant) -> bool {
        false
    }
}

// ─── Random bursts ──────────────────────────────────────────────────────────

/// Random short loss bursts on original transmissions.
///
/// Retransmissions always pass so that recovery can be observed.
pub struct RandomFaults {
    rng: SmallRng,
    /// One in `short_burst_odds` packets starts a 2-packet burst.
    short_burst_odds: u32,
    /// One in `long_burst_odds` packets starts a 4-packet burst.
    long_burst_odds: u32,
    remaining: u32,
}

impl RandomFaults {
    pub fn new(seed: u64) -> Self {
        Self::with_odds(seed, 200, 3000)
    }

    pub fn with_odds(seed: u64, short_burst_odds: u32, long_burst_odds: u32) -> Self {
        RandomFaults {
            rng: SmallRng::seed_from_u64(seed),
            short_burst_odds: short_burst_odds.max(1),
            long_burst_odds: long_burst_odds.max(1),
            remaining: 0,
        }
    }
}

impl FaultInjector for RandomFaults {
    fn should_drop(&mut self, ctx: &DispatchContext, _now: Instant) -> bool {
        if ctx.retransmission {
            return false;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        if self.rng.random_range(0..self.long_burst_odds) == 0 {
            self.remaining = 3;
            return true;
        }
        if self.rng.random_range(0..self.short_burst_odds) == 0 {
            self.remaining = 1;
            return true;
        }
        false
    }
}

// ─── Scripted ───────────────────────────────────────────────────────────────

/// Drops the first transmission of listed `(block, packet)` pairs.
#[derive(Debug, Default, Clone)]
pub struct ScriptedFaults {
    targets: HashSet<(u32, u8)>,
}

impl ScriptedFaults {
    pub fn new(targets: impl IntoIterator<Item = (u32, u8)>) -> Self {
        ScriptedFaults {
            targets: targets.into_iter().collect(),
        }
    }
}

impl FaultInjector for ScriptedFaults {
    fn should_drop(&mut self, ctx: &DispatchContext, _now: Instant) -> bool {
        !ctx.retransmission && self.targets.remove(&(ctx.block_index, ctx.packet_index))
    }
}
