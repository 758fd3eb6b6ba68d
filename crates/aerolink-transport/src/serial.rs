//! # Short-Packet Framing
//!
//! Low-bandwidth serial radios move small air frames. A full packet is cut
//! into short packets that fit the interface's air packet size; the far end
//! scans its byte stream for valid short packets and glues the payloads
//! back into full packets.

use bytes::{Bytes, BytesMut};

use crate::wire::{
    encode_short_packet, frame_total_length, is_valid_short_packet, validate, ShortMarker,
    ShortPacketHeader, MAX_SHORT_PAYLOAD, PACKET_HEADER_LEN, SHORT_HEADER_LEN,
};

/// Receive buffer size at which unparseable bytes are discarded.
const GARBAGE_LIMIT: usize = 400;
/// Bytes kept from the tail when discarding.
const GARBAGE_KEEP: usize = 256;

// ─── Splitter ───────────────────────────────────────────────────────────────

/// Cut `packet` into short packets of at most `air_packet_size` bytes.
///
/// `next_id` is the interface's running short-packet id and is advanced
/// once per short packet.
pub fn split_into_short_packets(
    packet: &[u8],
    air_packet_size: usize,
    next_id: &mut u8,
    last_ack_id: u8,
) -> Vec<BytesMut> {
    let usable = air_packet_size
        .saturating_sub(SHORT_HEADER_LEN)
        .clamp(1, MAX_SHORT_PAYLOAD);
    let mut out = Vec::with_capacity(packet.len().div_ceil(usable));
    let mut offset = 0;
    while offset < packet.len() {
        let remaining = packet.len() - offset;
        let chunk = remaining.min(usable);
        let marker = if remaining <= usable {
            ShortMarker::SequenceEnd
        } else if offset == 0 {
            ShortMarker::SequenceStart
        } else {
            ShortMarker::Regular
        };
        let mut buf = BytesMut::with_capacity(SHORT_HEADER_LEN + chunk);
        encode_short_packet(
            marker,
            *next_id,
            last_ack_id,
            &packet[offset..offset + chunk],
            &mut buf,
        );
        *next_id = next_id.wrapping_add(1);
        out.push(buf);
        offset += chunk;
    }
    out
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// The buffer starts with what looks like a short packet whose tail has not
/// arrived yet.
fn awaiting_rest(buf: &[u8]) -> bool {
    match buf.first() {
        Some(&b) if ShortMarker::from_byte(b).is_some() => {}
        _ => return false,
    }
    if buf.len() < SHORT_HEADER_LEN {
        return true;
    }
    let len = buf[SHORT_HEADER_LEN - 1] as usize;
    len <= MAX_SHORT_PAYLOAD && SHORT_HEADER_LEN + len > buf.len()
}

#[derive(Debug, Clone, Default)]
pub struct ReassemblyStats {
    pub short_packets: u64,
    pub packets: u64,
    pub garbage_bytes: u64,
    pub resets: u64,
    pub invalid_packets: u64,
}

/// Rebuilds full packets from a serial byte stream.
#[derive(Debug, Default)]
pub struct ShortPacketReassembler {
    buf: Vec<u8>,
    packet: Vec<u8>,
    last_id: Option<u8>,
    stats: ReassemblyStats,
}

impl ShortPacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    /// Append received bytes and return every full packet completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut complete = Vec::new();
        loop {
            if awaiting_rest(&self.buf) {
                break;
            }
            let Some(start) = (0..self.buf.len()).find(|&i| is_valid_short_packet(&self.buf[i..]))
            else {
                if self.buf.len() >= GARBAGE_LIMIT {
                    let drop = self.buf.len() - GARBAGE_KEEP;
                    self.stats.garbage_bytes += drop as u64;
                    self.buf.drain(..drop);
                }
                break;
            };
            self.stats.garbage_bytes += start as u64;
            let Some(header) = ShortPacketHeader::decode(&mut &self.buf[start..]) else {
                break;
            };
            let data_start = start + SHORT_HEADER_LEN;
            let data_end = data_start + header.data_length as usize;
            self.stats.short_packets += 1;

            let gap = self
                .last_id
                .is_some_and(|last| header.packet_id != last.wrapping_add(1));
            if header.marker == ShortMarker::SequenceStart || gap {
                if !self.packet.is_empty() {
                    self.stats.resets += 1;
                }
                self.packet.clear();
            }
            self.last_id = Some(header.packet_id);
            self.packet.extend_from_slice(&self.buf[data_start..data_end]);
            self.buf.drain(..data_end);

            if let Some(p) = self.take_packet() {
                complete.push(p);
            }
        }
        complete
    }

    fn take_packet(&mut self) -> Option<Bytes> {
        if self.packet.len() < PACKET_HEADER_LEN {
            return None;
        }
        let total = frame_total_length(&self.packet)?;
        if self.packet.len() < total {
            return None;
        }
        let ok = total >= PACKET_HEADER_LEN && validate(&self.packet[..total]);
        let out = ok.then(|| Bytes::copy_from_slice(&self.packet[..total]));
        if ok {
            self.stats.packets += 1;
        } else {
            self.stats.invalid_packets += 1;
        }
        self.packet.clear();
        out
    }
}
