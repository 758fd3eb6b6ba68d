//! Error types for the video transport.

use thiserror::Error;

use crate::codec::CodecError;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid encoding parameters: {0}")]
    InvalidEncoding(String),

    #[error("ring depth {depth} out of range ({min}..={max})")]
    RingDepth { depth: usize, min: usize, max: usize },

    #[error("no radio interface supports frequency {frequency_khz} kHz")]
    NoInterfaceForFrequency { frequency_khz: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
