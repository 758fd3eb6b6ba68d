//! # aerolink-transport
//!
//! Vehicle-side video transport for lossy broadcast radio links.
//!
//! Encoder output is cut into fixed-size packets, grouped into blocks
//! protected by systematic Reed-Solomon parity, kept in a ring for
//! retransmission on request, and fanned out over every capable radio
//! interface. Encoding changes take effect only between blocks.
//!
//! ## Crate structure
//!
//! - [`wire`]: packet and video headers, CRC, control messages, short packets
//! - [`codec`]: GF(2^8) erasure coder
//! - [`pool`]: transmit ring, packet buffers, sequence numbers
//! - [`sender`]: the scheduler that ties it all together
//! - [`arq`]: retransmission request history and duplication policy
//! - [`radio`]: interface boundary and dispatch
//! - [`serial`]: short-packet framing for low-capacity links
//! - [`gate`]: video profiles, link state, block-boundary encoding changes
//! - [`nal`]: H.264 frame tracking and keyframe interval negotiation
//! - [`fault`]: transmit-side loss injection
//! - [`ipc`]: control channel and message classification
//! - [`runtime`]: the transmit loop
//! - [`config`]: TOML configuration
//! - [`stats`]: counters, bitrate meters, published snapshots

pub mod arq;
pub mod codec;
pub mod config;
pub mod error;
pub mod fault;
pub mod gate;
pub mod ipc;
pub mod nal;
pub mod pool;
pub mod radio;
pub mod runtime;
pub mod sender;
pub mod serial;
pub mod stats;
pub mod wire;

pub use error::TransportError;
