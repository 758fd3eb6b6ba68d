//! # Aerolink Wire Format
//!
//! Fixed-offset, little-endian binary layouts shared by the vehicle and the
//! ground controller. Every radio packet starts with the 24-byte common
//! header; video packets follow it with the 27-byte video block header and
//! the payload.
//!
//! ## Common Header (24 bytes)
//!
//! ```text
//!  0       4     5     6           10       12       14       16          20          24
//! +-------+-----+-----+-----------+--------+--------+--------+-----------+-----------+
//! | CRC32 |flags|type | stream idx| ext fl | length | link ix| src id    | dest id   |
//! +-------+-----+-----+-----------+--------+--------+--------+-----------+-----------+
//! ```
//!
//! The CRC covers everything after the CRC field, up to the end of the
//! common header when `HEADERS_ONLY_CRC` is set, up to `total_length`
//! otherwise.
//!
//! ## Short packets
//!
//! Low-bandwidth serial links carry packets split into 5-byte-header short
//! packets protected by CRC-8 (see [`ShortPacketHeader`]).

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC, CRC_8_NRSC_5};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of the common packet header.
pub const PACKET_HEADER_LEN: usize = 24;

/// Size of the video block header carried after the common header.
pub const VIDEO_HEADER_LEN: usize = 27;

/// Both headers of a video packet.
pub const VIDEO_HEADERS_LEN: usize = PACKET_HEADER_LEN + VIDEO_HEADER_LEN;

/// Largest video payload per packet.
pub const MAX_PACKET_PAYLOAD: usize = 1250;

/// Largest radio packet, headers included.
pub const MAX_PACKET_TOTAL_SIZE: usize = 1500;

/// Largest number of data packets in one block.
pub const MAX_DATA_PACKETS: usize = 32;

/// Largest number of parity packets in one block.
pub const MAX_PARITY_PACKETS: usize = 32;

/// Largest number of packets (data + parity) in one block.
pub const MAX_PACKETS_IN_BLOCK: usize = MAX_DATA_PACKETS + MAX_PARITY_PACKETS;

/// Low 28 bits of the stream packet index hold the sequence number.
pub const STREAM_SEQ_MASK: u32 = 0x0FFF_FFFF;

/// The stream id lives in the top 4 bits of the stream packet index.
pub const STREAM_ID_SHIFT: u32 = 28;

pub const STREAM_ID_DATA: u8 = 0;
pub const STREAM_ID_TELEMETRY: u8 = 1;
pub const STREAM_ID_AUDIO: u8 = 2;
pub const STREAM_ID_DATA2: u8 = 3;
pub const STREAM_ID_VIDEO: u8 = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

// Byte offsets patched in place at dispatch time.
const OFFSET_FLAGS: usize = 4;
const OFFSET_STREAM_INDEX: usize = 6;
const OFFSET_TOTAL_LENGTH: usize = 12;
const OFFSET_RADIO_LINK_INDEX: usize = 14;

// ─── Packet Flags ────────────────────────────────────────────────────────────

/// Bits of the `packet_flags` byte.
pub mod flags {
    /// Bits 0-2 select the originating component.
    pub const COMPONENT_MASK: u8 = 0b0000_0111;
    /// CRC covers the common header only.
    pub const HEADERS_ONLY_CRC: u8 = 1 << 3;
    /// Packet is a retransmission of an earlier one.
    pub const RETRANSMITTED: u8 = 1 << 4;
    pub const HAS_ENCRYPTION: u8 = 1 << 6;
    /// Receiver may flush a partially assembled block.
    pub const CAN_START_TX: u8 = 1 << 7;
}

/// Bits of the `packet_flags_extended` field.
pub mod ext_flags {
    pub const HIGH_CAPACITY_LINK_ONLY: u16 = 1 << 8;
    pub const LOW_CAPACITY_LINK_ONLY: u16 = 1 << 9;
    pub const REQUIRE_ACK: u16 = 1 << 10;
}

/// Packet types understood by the video transport.
pub mod packet_type {
    /// Retransmission request without a request id.
    pub const VIDEO_REQ_MULTIPLE_PACKETS: u8 = 20;
    pub const VIDEO_ACK: u8 = 21;
    pub const VIDEO_DATA: u8 = 22;
    /// Retransmission request with a leading unique request id.
    pub const VIDEO_REQ_MULTIPLE_PACKETS2: u8 = 23;
    /// Local encoding update from the link-quality estimator.
    pub const LOCAL_ENCODING_UPDATE: u8 = 201;
    /// Keyframe interval command for the encoder process.
    pub const LOCAL_KEYFRAME_COMMAND: u8 = 202;
}

/// Component tag carried in the low bits of `packet_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Component {
    LocalControl = 0,
    Video = 1,
    Telemetry = 2,
    Commands = 3,
    Rc = 4,
    Control = 5,
    Audio = 6,
}

impl Component {
    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags & flags::COMPONENT_MASK {
            0 => Some(Component::LocalControl),
            1 => Some(Component::Video),
            2 => Some(Component::Telemetry),
            3 => Some(Component::Commands),
            4 => Some(Component::Rc),
            5 => Some(Component::Control),
            6 => Some(Component::Audio),
            _ => None,
        }
    }
}

// ─── Common Packet Header ────────────────────────────────────────────────────

/// Common header present on every radio packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub crc: u32,
    pub packet_flags: u8,
    pub packet_type: u8,
    /// Stream id (top 4 bits) and 28-bit sequence number.
    pub stream_packet_idx: u32,
    pub packet_flags_extended: u16,
    /// Length of the whole packet, headers included.
    pub total_length: u16,
    /// Per-interface running index, stamped by the radio dispatcher.
    pub radio_link_packet_index: u16,
    pub vehicle_id_src: u32,
    pub vehicle_id_dest: u32,
}

impl PacketHeader {
    pub const ENCODED_LEN: usize = PACKET_HEADER_LEN;

    /// Create a header for `component` with the given type and total length.
    pub fn new(component: Component, packet_type: u8, total_length: u16) -> Self {
        PacketHeader {
            packet_flags: component as u8,
            packet_type,
            total_length,
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.crc);
        buf.put_u8(self.packet_flags);
        buf.put_u8(self.packet_type);
        buf.put_u32_le(self.stream_packet_idx);
        buf.put_u16_le(self.packet_flags_extended);
        buf.put_u16_le(self.total_length);
        buf.put_u16_le(self.radio_link_packet_index);
        buf.put_u32_le(self.vehicle_id_src);
        buf.put_u32_le(self.vehicle_id_dest);
    }

    /// Decode a header. Returns `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(PacketHeader {
            crc: buf.get_u32_le(),
            packet_flags: buf.get_u8(),
            packet_type: buf.get_u8(),
            stream_packet_idx: buf.get_u32_le(),
            packet_flags_extended: buf.get_u16_le(),
            total_length: buf.get_u16_le(),
            radio_link_packet_index: buf.get_u16_le(),
            vehicle_id_src: buf.get_u32_le(),
            vehicle_id_dest: buf.get_u32_le(),
        })
    }

    /// Decode the header at the start of `frame` without consuming it.
    pub fn peek(frame: &[u8]) -> Option<Self> {
        let mut view = frame;
        Self::decode(&mut view)
    }

    /// Overwrite the first [`PACKET_HEADER_LEN`] bytes of `frame`.
    ///
    /// Panics if `frame` is shorter than a header.
    pub fn write_to(&self, frame: &mut [u8]) {
        let mut view = &mut frame[..Self::ENCODED_LEN];
        self.encode(&mut view);
    }

    pub fn component(&self) -> Option<Component> {
        Component::from_flags(self.packet_flags)
    }

    pub fn stream_id(&self) -> u8 {
        (self.stream_packet_idx >> STREAM_ID_SHIFT) as u8
    }

    pub fn stream_seq(&self) -> u32 {
        self.stream_packet_idx & STREAM_SEQ_MASK
    }

    pub fn set_stream(&mut self, stream_id: u8, seq: u32) {
        self.stream_packet_idx = compose_stream_index(stream_id, seq);
    }

    pub fn is_retransmitted(&self) -> bool {
        self.packet_flags & flags::RETRANSMITTED != 0
    }

    pub fn can_start_tx(&self) -> bool {
        self.packet_flags & flags::CAN_START_TX != 0
    }

    pub fn headers_only_crc(&self) -> bool {
        self.packet_flags & flags::HEADERS_ONLY_CRC != 0
    }
}

/// Pack a stream id and a 28-bit sequence into a stream packet index.
#[inline]
pub fn compose_stream_index(stream_id: u8, seq: u32) -> u32 {
    ((stream_id as u32 & 0x0F) << STREAM_ID_SHIFT) | (seq & STREAM_SEQ_MASK)
}

/// Distance from `from` to `to` in the 28-bit sequence space.
#[inline]
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & STREAM_SEQ_MASK
}

// ─── In-place frame patching ─────────────────────────────────────────────────

/// Set the packet flags byte of an encoded frame.
pub fn set_frame_flags(frame: &mut [u8], packet_flags: u8) {
    frame[OFFSET_FLAGS] = packet_flags;
}

/// Set the stream packet index of an encoded frame.
pub fn set_frame_stream_index(frame: &mut [u8], stream_packet_idx: u32) {
    frame[OFFSET_STREAM_INDEX..OFFSET_STREAM_INDEX + 4]
        .copy_from_slice(&stream_packet_idx.to_le_bytes());
}

/// Set the radio link packet index of an encoded frame.
pub fn set_frame_radio_link_index(frame: &mut [u8], index: u16) {
    frame[OFFSET_RADIO_LINK_INDEX..OFFSET_RADIO_LINK_INDEX + 2]
        .copy_from_slice(&index.to_le_bytes());
}

/// Read `total_length` from an encoded frame.
pub fn frame_total_length(frame: &[u8]) -> Option<usize> {
    let bytes = frame.get(OFFSET_TOTAL_LENGTH..OFFSET_TOTAL_LENGTH + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

// ─── CRC ─────────────────────────────────────────────────────────────────────

/// End of the CRC-protected region for a frame, or `None` when the declared
/// length is inconsistent with the buffer.
fn crc_region_end(frame: &[u8]) -> Option<usize> {
    if frame.len() < PACKET_HEADER_LEN {
        return None;
    }
    let total = frame_total_length(frame)?;
    if total < PACKET_HEADER_LEN || total > frame.len() {
        return None;
    }
    if frame[OFFSET_FLAGS] & flags::HEADERS_ONLY_CRC != 0 {
        Some(PACKET_HEADER_LEN)
    } else {
        Some(total)
    }
}

/// Compute and store the CRC of an encoded frame.
///
/// Returns `false` (and leaves the frame untouched) when the declared
/// length does not fit the buffer.
pub fn seal(frame: &mut [u8]) -> bool {
    let Some(end) = crc_region_end(frame) else {
        return false;
    };
    let crc = CRC32.checksum(&frame[4..end]);
    frame[..4].copy_from_slice(&crc.to_le_bytes());
    true
}

/// Recompute the CRC over the declared length and compare.
///
/// Fails closed: a buffer shorter than a header, a declared length below
/// the header size, or a declared length past the end of the buffer is
/// treated as corrupt.
pub fn validate(frame: &[u8]) -> bool {
    let Some(end) = crc_region_end(frame) else {
        return false;
    };
    let stored = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    CRC32.checksum(&frame[4..end]) == stored
}

// ─── Encoding Flags ──────────────────────────────────────────────────────────

/// Duplication setting carried in bits 16-23 of the encoding flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicationSetting {
    Off,
    /// Manual duplication percentage, 1..=10 (tens of percent).
    Percent(u8),
    /// Duplicate based on the link state.
    Auto,
}

/// Per-profile encoding flags (`encoding_extra_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EncodingFlags(pub u32);

impl EncodingFlags {
    pub const ENABLE_RETRANSMISSIONS: u32 = 1 << 0;
    pub const STATUS_ON_LOWER_BITRATE: u32 = 1 << 2;
    pub const RETRANSMISSION_WINDOW_MASK: u32 = 0xFF << 8;
    pub const DUPLICATION_MASK: u32 = 0xFF << 16;
    /// Duplication byte value selecting automatic duplication.
    pub const DUPLICATION_AUTO: u8 = 0xF0;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn retransmissions_enabled(self) -> bool {
        self.0 & Self::ENABLE_RETRANSMISSIONS != 0
    }

    pub fn with_retransmissions(self, enabled: bool) -> Self {
        self.with_bit(Self::ENABLE_RETRANSMISSIONS, enabled)
    }

    pub fn on_lower_bitrate(self) -> bool {
        self.0 & Self::STATUS_ON_LOWER_BITRATE != 0
    }

    pub fn with_lower_bitrate(self, active: bool) -> Self {
        self.with_bit(Self::STATUS_ON_LOWER_BITRATE, active)
    }

    /// Flags with the transient status bits cleared, for comparisons.
    pub fn without_status(self) -> Self {
        EncodingFlags(self.0 & !Self::STATUS_ON_LOWER_BITRATE)
    }

    /// Receiver-side retransmission window, in 5 ms units.
    pub fn retransmission_window_ms(self) -> u32 {
        ((self.0 & Self::RETRANSMISSION_WINDOW_MASK) >> 8) * 5
    }

    pub fn with_retransmission_window_ms(self, ms: u32) -> Self {
        let units = (ms / 5).min(0xFF);
        EncodingFlags((self.0 & !Self::RETRANSMISSION_WINDOW_MASK) | (units << 8))
    }

    pub fn duplication(self) -> DuplicationSetting {
        let raw = ((self.0 & Self::DUPLICATION_MASK) >> 16) as u8;
        let percent = raw >> 4;
        match percent {
            0x0F => DuplicationSetting::Auto,
            0 => DuplicationSetting::Off,
            p => DuplicationSetting::Percent(p.min(10)),
        }
    }

    pub fn with_duplication(self, setting: DuplicationSetting) -> Self {
        let raw: u32 = match setting {
            DuplicationSetting::Off => 0,
            DuplicationSetting::Percent(p) => (p.min(10) as u32) << 4,
            DuplicationSetting::Auto => Self::DUPLICATION_AUTO as u32,
        };
        EncodingFlags((self.0 & !Self::DUPLICATION_MASK) | (raw << 16))
    }

    fn with_bit(self, bit: u32, on: bool) -> Self {
        if on {
            EncodingFlags(self.0 | bit)
        } else {
            EncodingFlags(self.0 & !bit)
        }
    }
}

/// Encode a keyframe interval (in frames) into the one-byte header hint.
pub fn keyframe_hint(interval: u32) -> u8 {
    if interval < 200 {
        interval as u8
    } else {
        (200 + interval / 20).min(u8::MAX as u32) as u8
    }
}

// ─── Video Block Header ──────────────────────────────────────────────────────

/// Header carried by every video data and parity packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoBlockHeader {
    /// Stream index (low nibble) and codec type (high nibble).
    pub stream_and_type: u8,
    pub profile: u8,
    pub encoding_flags: EncodingFlags,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub keyframe_hint: u8,
    /// Erasure-coding time spent in the last measurement window, µs.
    pub fec_time_us: u16,
    /// Id of the last retransmission request received, 0 if none.
    pub last_request_id: u32,
    pub block_index: u32,
    pub packet_index: u8,
    pub data_packets: u8,
    pub parity_packets: u8,
    /// Payload bytes per packet (shard length).
    pub packet_length: u16,
}

impl VideoBlockHeader {
    pub const ENCODED_LEN: usize = VIDEO_HEADER_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.stream_and_type);
        buf.put_u8(self.profile);
        buf.put_u32_le(self.encoding_flags.bits());
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u8(self.fps);
        buf.put_u8(self.keyframe_hint);
        buf.put_u16_le(self.fec_time_us);
        buf.put_u32_le(self.last_request_id);
        buf.put_u32_le(self.block_index);
        buf.put_u8(self.packet_index);
        buf.put_u8(self.data_packets);
        buf.put_u8(self.parity_packets);
        buf.put_u16_le(self.packet_length);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(VideoBlockHeader {
            stream_and_type: buf.get_u8(),
            profile: buf.get_u8(),
            encoding_flags: EncodingFlags(buf.get_u32_le()),
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
            fps: buf.get_u8(),
            keyframe_hint: buf.get_u8(),
            fec_time_us: buf.get_u16_le(),
            last_request_id: buf.get_u32_le(),
            block_index: buf.get_u32_le(),
            packet_index: buf.get_u8(),
            data_packets: buf.get_u8(),
            parity_packets: buf.get_u8(),
            packet_length: buf.get_u16_le(),
        })
    }

    /// Decode the video header of a full video frame.
    pub fn peek(frame: &[u8]) -> Option<Self> {
        let mut view = frame.get(PACKET_HEADER_LEN..)?;
        Self::decode(&mut view)
    }

    /// Overwrite the video header region of a full video frame.
    pub fn write_to(&self, frame: &mut [u8]) {
        let mut view = &mut frame[PACKET_HEADER_LEN..VIDEO_HEADERS_LEN];
        self.encode(&mut view);
    }

    pub fn total_packets(&self) -> usize {
        self.data_packets as usize + self.parity_packets as usize
    }

    pub fn is_parity(&self) -> bool {
        self.packet_index >= self.data_packets
    }
}

// ─── Retransmission Request ──────────────────────────────────────────────────

/// One (block, packet) pair named by a retransmission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedPacket {
    pub block_index: u32,
    pub packet_index: u8,
    /// How many times the receiver has already asked for this packet.
    pub repeat_count: u8,
}

impl RequestedPacket {
    pub const ENCODED_LEN: usize = 6;
}

/// Body of a `VIDEO_REQ_MULTIPLE_PACKETS(2)` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmissionRequest {
    /// Present only on the `..2` packet type.
    pub request_id: Option<u32>,
    pub stream_id: u8,
    pub packets: Vec<RequestedPacket>,
}

impl RetransmissionRequest {
    /// Packet type matching the presence of a request id.
    pub fn packet_type(&self) -> u8 {
        if self.request_id.is_some() {
            packet_type::VIDEO_REQ_MULTIPLE_PACKETS2
        } else {
            packet_type::VIDEO_REQ_MULTIPLE_PACKETS
        }
    }

    pub fn encoded_len(&self) -> usize {
        let id = if self.request_id.is_some() { 4 } else { 0 };
        id + 2 + self.packets.len() * RequestedPacket::ENCODED_LEN
    }

    /// Encode the body. At most 255 entries are written.
    pub fn encode(&self, buf: &mut impl BufMut) {
        if let Some(id) = self.request_id {
            buf.put_u32_le(id);
        }
        let count = self.packets.len().min(u8::MAX as usize);
        buf.put_u8(self.stream_id);
        buf.put_u8(count as u8);
        for p in &self.packets[..count] {
            buf.put_u32_le(p.block_index);
            buf.put_u8(p.packet_index);
            buf.put_u8(p.repeat_count);
        }
    }

    /// Decode a request body of the given packet type.
    ///
    /// Returns `None` for unrelated packet types or truncated bodies.
    pub fn decode(kind: u8, buf: &mut impl Buf) -> Option<Self> {
        let request_id = match kind {
            packet_type::VIDEO_REQ_MULTIPLE_PACKETS => None,
            packet_type::VIDEO_REQ_MULTIPLE_PACKETS2 => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(buf.get_u32_le())
            }
            _ => return None,
        };
        if buf.remaining() < 2 {
            return None;
        }
        let stream_id = buf.get_u8();
        let count = buf.get_u8() as usize;
        if buf.remaining() < count * RequestedPacket::ENCODED_LEN {
            return None;
        }
        let packets = (0..count)
            .map(|_| RequestedPacket {
                block_index: buf.get_u32_le(),
                packet_index: buf.get_u8(),
                repeat_count: buf.get_u8(),
            })
            .collect();
        Some(RetransmissionRequest {
            request_id,
            stream_id,
            packets,
        })
    }

    /// Build a complete, sealed request packet as a ground station would.
    pub fn to_packet(&self, vehicle_id_src: u32, vehicle_id_dest: u32) -> BytesMut {
        let total = PACKET_HEADER_LEN + self.encoded_len();
        let mut header = PacketHeader::new(Component::Video, self.packet_type(), total as u16);
        header.vehicle_id_src = vehicle_id_src;
        header.vehicle_id_dest = vehicle_id_dest;
        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf);
        self.encode(&mut buf);
        seal(&mut buf);
        buf
    }
}

// ─── Local Encoding Update ───────────────────────────────────────────────────

/// Output of the link-quality estimator, delivered over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodingUpdate {
    pub profile: u8,
    /// Data packets per block; 0 (with `parity_packets` 0) means "use the
    /// profile's values".
    pub data_packets: u8,
    pub parity_packets: u8,
    /// How many quality levels the estimator has shifted down.
    pub shift_level: u8,
    pub lower_bitrate: bool,
    /// Keyframe interval in frames; 0 leaves it unchanged.
    pub keyframe_interval: u16,
}

impl EncodingUpdate {
    pub const ENCODED_LEN: usize = 7;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.profile);
        buf.put_u8(self.data_packets);
        buf.put_u8(self.parity_packets);
        buf.put_u8(self.shift_level);
        buf.put_u8(self.lower_bitrate as u8);
        buf.put_u16_le(self.keyframe_interval);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(EncodingUpdate {
            profile: buf.get_u8(),
            data_packets: buf.get_u8(),
            parity_packets: buf.get_u8(),
            shift_level: buf.get_u8(),
            lower_bitrate: buf.get_u8() != 0,
            keyframe_interval: buf.get_u16_le(),
        })
    }

    /// Build a complete, sealed local-control packet.
    pub fn to_packet(&self) -> BytesMut {
        let total = PACKET_HEADER_LEN + Self::ENCODED_LEN;
        let header = PacketHeader::new(
            Component::LocalControl,
            packet_type::LOCAL_ENCODING_UPDATE,
            total as u16,
        );
        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf);
        self.encode(&mut buf);
        seal(&mut buf);
        buf
    }
}

/// New keyframe interval for the encoder collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeCommand {
    /// Interval in frames.
    pub interval: u16,
    /// The same interval as carried in video headers.
    pub hint: u8,
}

impl KeyframeCommand {
    pub const ENCODED_LEN: usize = 3;

    pub fn new(interval: u32) -> Self {
        KeyframeCommand {
            interval: interval.min(u16::MAX as u32) as u16,
            hint: keyframe_hint(interval),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.interval);
        buf.put_u8(self.hint);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(KeyframeCommand {
            interval: buf.get_u16_le(),
            hint: buf.get_u8(),
        })
    }

    pub fn to_packet(&self) -> BytesMut {
        let total = PACKET_HEADER_LEN + Self::ENCODED_LEN;
        let header = PacketHeader::new(
            Component::LocalControl,
            packet_type::LOCAL_KEYFRAME_COMMAND,
            total as u16,
        );
        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf);
        self.encode(&mut buf);
        seal(&mut buf);
        buf
    }
}

// ─── Short Packets ───────────────────────────────────────────────────────────

/// Size of the short packet header.
pub const SHORT_HEADER_LEN: usize = 5;

/// Largest payload of a single short packet.
pub const MAX_SHORT_PAYLOAD: usize = 240;

/// Start marker of a short packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShortMarker {
    /// Continuation of a packet split across short packets.
    Regular = 0xF0,
    /// First short packet of a full packet.
    SequenceStart = 0xF1,
    /// Last short packet of a full packet.
    SequenceEnd = 0xF2,
}

impl ShortMarker {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0xF0 => Some(ShortMarker::Regular),
            0xF1 => Some(ShortMarker::SequenceStart),
            0xF2 => Some(ShortMarker::SequenceEnd),
            _ => None,
        }
    }
}

/// Compact header used on low-bandwidth serial links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortPacketHeader {
    pub marker: ShortMarker,
    /// CRC-8 over every byte after this field.
    pub crc: u8,
    pub packet_id: u8,
    pub last_ack_id: u8,
    pub data_length: u8,
}

impl ShortPacketHeader {
    pub const ENCODED_LEN: usize = SHORT_HEADER_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.marker as u8);
        buf.put_u8(self.crc);
        buf.put_u8(self.packet_id);
        buf.put_u8(self.last_ack_id);
        buf.put_u8(self.data_length);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        let marker = ShortMarker::from_byte(buf.get_u8())?;
        Some(ShortPacketHeader {
            marker,
            crc: buf.get_u8(),
            packet_id: buf.get_u8(),
            last_ack_id: buf.get_u8(),
            data_length: buf.get_u8(),
        })
    }
}

/// Build one sealed short packet carrying `data` (at most
/// [`MAX_SHORT_PAYLOAD`] bytes, longer input is truncated).
pub fn encode_short_packet(
    marker: ShortMarker,
    packet_id: u8,
    last_ack_id: u8,
    data: &[u8],
    buf: &mut BytesMut,
) {
    let data = &data[..data.len().min(MAX_SHORT_PAYLOAD)];
    let start = buf.len();
    ShortPacketHeader {
        marker,
        crc: 0,
        packet_id,
        last_ack_id,
        data_length: data.len() as u8,
    }
    .encode(buf);
    buf.extend_from_slice(data);
    let crc = CRC8.checksum(&buf[start + 2..]);
    buf[start + 1] = crc;
}

/// Whether `buf` starts with a complete, uncorrupted short packet.
pub fn is_valid_short_packet(buf: &[u8]) -> bool {
    let Some(header) = ShortPacketHeader::decode(&mut &buf[..]) else {
        return false;
    };
    let len = header.data_length as usize;
    if len > MAX_SHORT_PAYLOAD || SHORT_HEADER_LEN + len > buf.len() {
        return false;
    }
    CRC8.checksum(&buf[2..SHORT_HEADER_LEN + len]) == header.crc
}
