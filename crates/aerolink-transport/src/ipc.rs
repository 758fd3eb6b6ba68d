//! # Control Channel
//!
//! Messages between the transmit loop and its local collaborators: the
//! link-quality estimator (encoding updates), the ground-station request
//! path (retransmission requests) and the encoder (keyframe commands).
//!
//! Messages are complete sealed packets. The loop only sends and receives;
//! [`classify`] decides what a received message means.

use std::io::{ErrorKind, Read, Write};

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::wire::{
    packet_type, validate, EncodingUpdate, PacketHeader, RetransmissionRequest, PACKET_HEADER_LEN,
};

/// Largest message the stream framer carries.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

pub trait MessageChannel {
    fn send(&mut self, msg: &[u8]) -> anyhow::Result<()>;
    /// Next pending message, `None` when nothing is waiting.
    fn try_recv(&mut self) -> anyhow::Result<Option<Bytes>>;
}

// ─── Classification ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Retransmission(RetransmissionRequest),
    EncodingUpdate(EncodingUpdate),
    /// Failed CRC or a malformed body.
    Corrupt,
    /// Valid but not addressed to the loop.
    Ignored,
}

pub fn classify(msg: &[u8]) -> ControlMessage {
    if !validate(msg) {
        return ControlMessage::Corrupt;
    }
    let Some(header) = PacketHeader::peek(msg) else {
        return ControlMessage::Corrupt;
    };
    let end = (header.total_length as usize).min(msg.len());
    let mut body = &msg[PACKET_HEADER_LEN..end];
    match header.packet_type {
        packet_type::VIDEO_REQ_MULTIPLE_PACKETS | packet_type::VIDEO_REQ_MULTIPLE_PACKETS2 => {
            RetransmissionRequest::decode(header.packet_type, &mut body)
                .map_or(ControlMessage::Corrupt, ControlMessage::Retransmission)
        }
        packet_type::LOCAL_ENCODING_UPDATE => EncodingUpdate::decode(&mut body)
            .map_or(ControlMessage::Corrupt, ControlMessage::EncodingUpdate),
        _ => ControlMessage::Ignored,
    }
}

// ─── In-process ─────────────────────────────────────────────────────────────

/// One end of a bounded in-process channel pair.
pub struct InProcessChannel {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl InProcessChannel {
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = bounded(capacity);
        let (b_tx, b_rx) = bounded(capacity);
        (
            InProcessChannel { tx: a_tx, rx: b_rx },
            InProcessChannel { tx: b_tx, rx: a_rx },
        )
    }
}

impl MessageChannel for InProcessChannel {
    fn send(&mut self, msg: &[u8]) -> anyhow::Result<()> {
        match self.tx.try_send(Bytes::copy_from_slice(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => anyhow::bail!("control channel full"),
            Err(TrySendError::Disconnected(_)) => anyhow::bail!("control channel closed"),
        }
    }

    fn try_recv(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => anyhow::bail!("control channel closed"),
        }
    }
}

// ─── Stream framing ─────────────────────────────────────────────────────────

/// Append `msg` with a little-endian u16 length prefix.
pub fn encode_frame(msg: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
    anyhow::ensure!(
        msg.len() <= MAX_FRAME_LEN,
        "message of {} bytes exceeds frame limit",
        msg.len()
    );
    out.reserve(2 + msg.len());
    out.put_u16_le(msg.len() as u16);
    out.put_slice(msg);
    Ok(())
}

/// Splits a byte stream back into length-prefixed messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// A message channel over a nonblocking byte stream.
pub struct FramedStream<S> {
    stream: S,
    decoder: FrameDecoder,
    out: BytesMut,
}

impl<S: Read + Write> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        FramedStream {
            stream,
            decoder: FrameDecoder::new(),
            out: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write> MessageChannel for FramedStream<S> {
    fn send(&mut self, msg: &[u8]) -> anyhow::Result<()> {
        self.out.clear();
        encode_frame(msg, &mut self.out)?;
        self.stream
            .write_all(&self.out)
            .context("control stream write")
    }

    fn try_recv(&mut self) -> anyhow::Result<Option<Bytes>> {
        if let Some(frame) = self.decoder.next_frame() {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 2048];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => anyhow::bail!("control stream closed"),
                Ok(n) => {
                    self.decoder.push(&chunk[..n]);
                    if let Some(frame) = self.decoder.next_frame() {
                        return Ok(Some(frame));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("control stream read"),
            }
        }
    }
}
