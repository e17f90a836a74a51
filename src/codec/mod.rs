//! Block decompression dispatch.
//!
//! # Selector
//! Every compressed region (the metadata blob and each storage block) is
//! tagged by a flags word whose low 6 bits select the algorithm. The numeric
//! values are fixed by the bundle format:
//!
//! | value | algorithm |
//! |-------|-----------|
//! | 0     | None      |
//! | 1     | Lzma      |
//! | 2     | Lz4       |
//! | 3     | Lz4HC     |
//! | 4     | LzHAM     |
//! | 5     | Lz4Mr0k   |
//!
//! # Mr0k
//! `Lz4Mr0k` regions larger than 255 bytes are wrapped in an extra encryption
//! envelope. Stripping it is delegated to an [`Envelope`] implementation
//! supplied by the caller; the codec only enforces the size guard and hands
//! the remaining window to LZ4.
//!
//! # Unimplemented selectors
//! `None`, `Lzma`, `LzHAM` and unknown values apply no transform: the output
//! keeps whatever it was pre-filled with. A warning is logged for each such
//! region.

use thiserror::Error;
use tracing::warn;

/// Mr0k regions at or below this size carry no envelope.
pub const MR0K_ENVELOPE_THRESHOLD: usize = 0xFF;
/// Smallest LZ4 region accepted after the envelope is removed.
pub const MR0K_MIN_LENGTH: usize = 0x10;

// ── CompressionType ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lzma,
    Lz4,
    Lz4HC,
    LzHAM,
    Lz4Mr0k,
    /// Selector with no assigned algorithm.
    Other(u8),
}

impl CompressionType {
    /// Decode the low 6 bits of a flags word.
    pub fn from_flags(flags: u32) -> Self {
        match flags % 0x40 {
            0 => CompressionType::None,
            1 => CompressionType::Lzma,
            2 => CompressionType::Lz4,
            3 => CompressionType::Lz4HC,
            4 => CompressionType::LzHAM,
            5 => CompressionType::Lz4Mr0k,
            n => CompressionType::Other(n as u8),
        }
    }

    /// The 6-bit selector value.
    pub fn selector(self) -> u8 {
        match self {
            CompressionType::None     => 0,
            CompressionType::Lzma     => 1,
            CompressionType::Lz4      => 2,
            CompressionType::Lz4HC    => 3,
            CompressionType::LzHAM    => 4,
            CompressionType::Lz4Mr0k  => 5,
            CompressionType::Other(n) => n,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None     => "none",
            CompressionType::Lzma     => "lzma",
            CompressionType::Lz4      => "lz4",
            CompressionType::Lz4HC    => "lz4hc",
            CompressionType::LzHAM    => "lzham",
            CompressionType::Lz4Mr0k  => "lz4mr0k",
            CompressionType::Other(_) => "unknown",
        }
    }

    pub fn is_implemented(self) -> bool {
        matches!(self, CompressionType::Lz4 | CompressionType::Lz4HC | CompressionType::Lz4Mr0k)
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Lz4 decompression error, wrote {written} bytes but expected {expected} bytes")]
    SizeMismatch { written: usize, expected: usize },
    #[error("Lz4 decompression error: {0}")]
    Decompression(String),
    #[error("Lz4 decompression error, wrong compressed length: {0}")]
    EnvelopeCorrupt(usize),
    #[error("Envelope window {offset}+{length} exceeds region of {available} bytes")]
    EnvelopeOutOfRange { offset: usize, length: usize, available: usize },
    #[error("Region of {0} bytes is Mr0k-enveloped but no envelope decryptor was supplied")]
    EnvelopeUnavailable(usize),
    /// Raised by [`Envelope`] implementations that reject a region.
    #[error("Envelope decryption failed: {0}")]
    Envelope(String),
    #[error("Cannot allocate {0} bytes for decompressed output")]
    Allocation(usize),
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Removes the Mr0k encryption layer from a compressed region.
///
/// Implementations own their key material (expansion key, per-asset key,
/// constant key, substitution box). `data` may be decrypted in place; the
/// return value is the `(offset, length)` of the LZ4 block inside `data`.
pub trait Envelope: Send + Sync {
    fn decrypt(&self, data: &mut [u8]) -> Result<(usize, usize), CodecError>;
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// Decompress `compressed` into `output`, which must be exactly the declared
/// uncompressed size.
pub fn decompress_into(
    kind: CompressionType,
    compressed: &mut [u8],
    output: &mut [u8],
    envelope: Option<&dyn Envelope>,
) -> Result<(), CodecError> {
    match kind {
        CompressionType::Lz4 | CompressionType::Lz4HC => lz4_exact(compressed, output),
        CompressionType::Lz4Mr0k => {
            let available = compressed.len();
            let (offset, length) = if available > MR0K_ENVELOPE_THRESHOLD {
                envelope
                    .ok_or(CodecError::EnvelopeUnavailable(available))?
                    .decrypt(compressed)?
            } else {
                (0, available)
            };
            if length < MR0K_MIN_LENGTH {
                return Err(CodecError::EnvelopeCorrupt(length));
            }
            let window = offset
                .checked_add(length)
                .and_then(|end| compressed.get(offset..end))
                .ok_or(CodecError::EnvelopeOutOfRange { offset, length, available })?;
            lz4_exact(window, output)
        }
        other => {
            warn!(
                selector = other.selector(),
                compression = other.name(),
                bytes = output.len(),
                "unsupported compression, region left zero-filled"
            );
            Ok(())
        }
    }
}

/// Convenience wrapper that allocates the zeroed output buffer.
pub fn decompress(
    kind: CompressionType,
    compressed: &mut [u8],
    uncompressed_size: usize,
    envelope: Option<&dyn Envelope>,
) -> Result<Vec<u8>, CodecError> {
    let mut output: Vec<u8> = Vec::new();
    output
        .try_reserve_exact(uncompressed_size)
        .map_err(|_| CodecError::Allocation(uncompressed_size))?;
    output.resize(uncompressed_size, 0);
    decompress_into(kind, compressed, &mut output, envelope)?;
    Ok(output)
}

fn lz4_exact(input: &[u8], output: &mut [u8]) -> Result<(), CodecError> {
    let written = lz4_flex::block::decompress_into(input, output)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    if written != output.len() {
        return Err(CodecError::SizeMismatch { written, expected: output.len() });
    }
    Ok(())
}
