//! # Transmit Block Ring
//!
//! Fixed-depth ring of pre-allocated block slots. Each slot holds every
//! packet of one erasure-coded block (up to 32 data + 32 parity) as a
//! complete radio frame, headers included, so a retransmission is a plain
//! re-send of the stored bytes.
//!
//! A slot is only recycled when the writer wraps back to it; until then any
//! packet in it can be served again.

use crate::error::TransportError;
use crate::wire::{MAX_PACKETS_IN_BLOCK, MAX_PACKET_TOTAL_SIZE, STREAM_SEQ_MASK, VIDEO_HEADERS_LEN};

/// Smallest accepted ring depth: the writer plus three trickle slots.
pub const MIN_RING_DEPTH: usize = 4;
pub const MAX_RING_DEPTH: usize = 4096;
pub const DEFAULT_RING_DEPTH: usize = 200;

// ─── PacketState ─────────────────────────────────────────────────────────────

/// Lifecycle of one packet buffer. Only moves forward until the slot is
/// recycled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketState {
    #[default]
    Empty,
    /// Payload complete, ready to send.
    Read,
    /// Sent at least once.
    Sent,
}

// ─── PacketBuffer ────────────────────────────────────────────────────────────

/// One radio frame buffer.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub state: PacketState,
    /// Payload bytes written so far.
    pub fill: usize,
    frame: Box<[u8]>,
}

impl PacketBuffer {
    fn new() -> Self {
        PacketBuffer {
            state: PacketState::Empty,
            fill: 0,
            frame: vec![0u8; MAX_PACKET_TOTAL_SIZE].into_boxed_slice(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state >= PacketState::Read
    }

    /// Frame bytes for a block with the given payload length.
    pub fn frame(&self, packet_length: usize) -> &[u8] {
        &self.frame[..VIDEO_HEADERS_LEN + packet_length]
    }

    pub fn frame_mut(&mut self, packet_length: usize) -> &mut [u8] {
        &mut self.frame[..VIDEO_HEADERS_LEN + packet_length]
    }

    pub fn payload(&self, packet_length: usize) -> &[u8] {
        &self.frame[VIDEO_HEADERS_LEN..VIDEO_HEADERS_LEN + packet_length]
    }

    pub fn payload_mut(&mut self, packet_length: usize) -> &mut [u8] {
        &mut self.frame[VIDEO_HEADERS_LEN..VIDEO_HEADERS_LEN + packet_length]
    }
}

// ─── BlockSlot ───────────────────────────────────────────────────────────────

/// Storage for one block. `data_packets`, `parity_packets` and
/// `packet_length` are fixed when the slot is recycled and shared by every
/// packet in it.
#[derive(Debug, Clone)]
pub struct BlockSlot {
    pub block_index: Option<u32>,
    pub data_packets: usize,
    pub parity_packets: usize,
    pub packet_length: usize,
    pub packets: Vec<PacketBuffer>,
}

impl BlockSlot {
    fn new() -> Self {
        BlockSlot {
            block_index: None,
            data_packets: 0,
            parity_packets: 0,
            packet_length: 0,
            packets: (0..MAX_PACKETS_IN_BLOCK).map(|_| PacketBuffer::new()).collect(),
        }
    }

    /// Reset the slot for a new block.
    pub fn recycle(
        &mut self,
        block_index: u32,
        data_packets: usize,
        parity_packets: usize,
        packet_length: usize,
    ) {
        self.block_index = Some(block_index);
        self.data_packets = data_packets;
        self.parity_packets = parity_packets;
        self.packet_length = packet_length;
        for p in &mut self.packets {
            p.state = PacketState::Empty;
            p.fill = 0;
        }
    }

    pub fn total_packets(&self) -> usize {
        self.data_packets + self.parity_packets
    }

    /// Every packet of the block is at least `Read`.
    pub fn is_complete(&self) -> bool {
        self.block_index.is_some()
            && self.packets[..self.total_packets()].iter().all(PacketBuffer::is_ready)
    }

    /// Split into data and parity payload views. The two regions never
    /// alias.
    pub fn shards_mut(&mut self) -> (Vec<&[u8]>, Vec<&mut [u8]>) {
        let len = self.packet_length;
        let total = self.total_packets();
        let (data, rest) = self.packets[..total].split_at_mut(self.data_packets);
        let data: &[PacketBuffer] = data;
        let data = data.iter().map(|p| p.payload(len)).collect();
        let parity = rest.iter_mut().map(|p| p.payload_mut(len)).collect();
        (data, parity)
    }
}

// ─── RingIndex ───────────────────────────────────────────────────────────────

/// Wrap-safe position in a ring of fixed depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    pos: usize,
    depth: usize,
}

impl RingIndex {
    pub fn new(pos: usize, depth: usize) -> Self {
        RingIndex {
            pos: pos % depth,
            depth,
        }
    }

    pub fn get(self) -> usize {
        self.pos
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(self) -> Self {
        RingIndex::new(self.pos + 1, self.depth)
    }

    pub fn prev(self) -> Self {
        self.back(1).unwrap_or(self)
    }

    /// Position `n` slots behind this one, `None` when `n` reaches past the
    /// ring depth.
    pub fn back(self, n: usize) -> Option<Self> {
        if n >= self.depth {
            return None;
        }
        Some(RingIndex::new(self.pos + self.depth - n, self.depth))
    }
}

// ─── BlockRing ───────────────────────────────────────────────────────────────

pub struct BlockRing {
    slots: Vec<BlockSlot>,
    write: RingIndex,
    /// Oldest slot not yet sent as a whole block.
    send: RingIndex,
}

impl BlockRing {
    pub fn new(depth: usize) -> Result<Self, TransportError> {
        if !(MIN_RING_DEPTH..=MAX_RING_DEPTH).contains(&depth) {
            return Err(TransportError::RingDepth {
                depth,
                min: MIN_RING_DEPTH,
                max: MAX_RING_DEPTH,
            });
        }
        Ok(BlockRing {
            slots: (0..depth).map(|_| BlockSlot::new()).collect(),
            write: RingIndex::new(0, depth),
            send: RingIndex::new(0, depth),
        })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn write_index(&self) -> RingIndex {
        self.write
    }

    pub fn send_index(&self) -> RingIndex {
        self.send
    }

    pub fn slot(&self, idx: RingIndex) -> &BlockSlot {
        &self.slots[idx.get()]
    }

    pub fn slot_mut(&mut self, idx: RingIndex) -> &mut BlockSlot {
        &mut self.slots[idx.get()]
    }

    pub fn write_slot(&self) -> &BlockSlot {
        self.slot(self.write)
    }

    pub fn write_slot_mut(&mut self) -> &mut BlockSlot {
        let idx = self.write;
        self.slot_mut(idx)
    }

    /// Move the writer to the next slot and recycle it for `block_index`.
    ///
    /// Returns `true` when the writer lapped the send cursor: the recycled
    /// slot held the oldest unsent block, and the cursor moves past it.
    pub fn advance(
        &mut self,
        block_index: u32,
        data_packets: usize,
        parity_packets: usize,
        packet_length: usize,
    ) -> bool {
        self.write = self.write.next();
        let overrun = self.write == self.send;
        if overrun {
            self.send = self.send.next();
        }
        self.write_slot_mut()
            .recycle(block_index, data_packets, parity_packets, packet_length);
        overrun
    }

    /// How many slots `idx` sits behind the writer (0 for the write slot).
    pub fn slots_behind_writer(&self, idx: RingIndex) -> usize {
        let depth = self.depth();
        (self.write.get() + depth - idx.get()) % depth
    }

    /// The oldest unsent slot, when it is complete.
    pub fn first_complete_block(&self) -> Option<RingIndex> {
        if self.send == self.write {
            return None;
        }
        self.slot(self.send).is_complete().then_some(self.send)
    }

    /// Complete blocks waiting behind the send cursor.
    pub fn ready_blocks(&self) -> usize {
        let mut idx = self.send;
        let mut n = 0;
        while idx != self.write && self.slot(idx).is_complete() {
            n += 1;
            idx = idx.next();
        }
        n
    }

    /// Mark the slot at the send cursor as sent and move past it.
    pub fn advance_send(&mut self) {
        if self.send != self.write {
            self.send = self.send.next();
        }
    }

    /// Locate `requested` given that the writer holds `current_block`.
    ///
    /// `None` when the block is in the future, older than the ring, or its
    /// slot has since been reused.
    pub fn resolve(&self, current_block: u32, requested: u32) -> Option<RingIndex> {
        if requested > current_block {
            return None;
        }
        let idx = self.write.back((current_block - requested) as usize)?;
        (self.slot(idx).block_index == Some(requested)).then_some(idx)
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Video stream sequence numbers, wrapping at 2^28.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: u32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let seq = self.next;
        self.next = (self.next + 1) & STREAM_SEQ_MASK;
        seq
    }

    pub fn current(&self) -> u32 {
        self.next
    }
}
