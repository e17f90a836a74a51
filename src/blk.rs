//! Blk / Ec2b key-blob containers.
//!
//! Both variants store a wrapped 16-byte key followed by a payload. The key,
//! a checksum over the first `seed_size` payload bytes and a per-title
//! constant combine into the seed of a 4 KiB MT19937-64 keystream.
//!
//! Layout (little-endian):
//! ```text
//! Blk:  "blk\0" | i32 key_len | key | key_len × 0xFF | i16 seed_size | payload
//! Ec2b: "Ec2b"  | i32 key_len | key | i32 seed_size               | payload
//! ```
//!
//! A Blk payload is XOR-encrypted with the keystream. An Ec2b payload is
//! random filler; the decrypted output *is* the keystream.

use thiserror::Error;
use tracing::debug;

use crate::crypto::{apply_xor_pad, random_u64, xor_pad, CryptoError, KeyWrap, KEY_SIZE, XOR_PAD_SIZE};
use crate::cursor::{CursorError, Endian, EndianReader, EndianWriter};

/// Upper bound on the number of payload bytes folded into the seed.
pub const SEED_BLOCK_SIZE: usize = 0x800;

pub const BLK_MAGIC: &[u8; 4] = b"blk\0";
pub const EC2B_MAGIC: &[u8; 4] = b"Ec2b";

#[derive(Error, Debug)]
pub enum BlkError {
    #[error("Invalid magic: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: &'static [u8; 4], found: Vec<u8> },
    #[error("Stored key must be {KEY_SIZE} bytes, header declares {0}")]
    InvalidKeyLength(i32),
    #[error("Seed region of {seed_size} bytes exceeds payload of {data_size} bytes")]
    Truncated { seed_size: usize, data_size: usize },
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Malformed header: {0}")]
    Cursor(#[from] CursorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkVariant {
    Blk,
    Ec2b,
}

impl BlkVariant {
    pub fn magic(self) -> &'static [u8; 4] {
        match self {
            BlkVariant::Blk  => BLK_MAGIC,
            BlkVariant::Ec2b => EC2B_MAGIC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlkVariant::Blk  => "blk",
            BlkVariant::Ec2b => "ec2b",
        }
    }
}

/// Caller-supplied key material. Immutable for the codec's lifetime.
pub struct BlkKeys {
    pub wrap: KeyWrap,
    pub const64: u64,
}

impl BlkKeys {
    pub fn new(expansion_key: &[u8], const_key: &[u8], sbox: Option<&[u8]>, const64: u64) -> Result<Self, CryptoError> {
        Ok(Self { wrap: KeyWrap::new(expansion_key, const_key, sbox)?, const64 })
    }
}

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlkHeader {
    /// Key in its stored (wrapped) form.
    pub key: [u8; KEY_SIZE],
    /// Clamped to `0..=SEED_BLOCK_SIZE`.
    pub seed_size: usize,
}

/// Payload source for [`BlkCodec::encrypt`].
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Existing bytes, XOR-encrypted for Blk and embedded as-is for Ec2b.
    Data(&'a [u8]),
    /// `n` bytes of random 64-bit words (a fresh Ec2b blob).
    Random(usize),
}

/// Seed region size for a freshly generated payload of `data_size` bytes.
pub fn seed_size_for(data_size: usize) -> usize {
    (data_size / 8 * 8).min(SEED_BLOCK_SIZE)
}

/// XOR-fold the first `seed_size` bytes of `buffer` as LE `u64` words into
/// an all-ones accumulator.
pub fn seed_checksum(buffer: &[u8], seed_size: usize) -> Result<u64, BlkError> {
    let region = buffer.get(..seed_size).ok_or(BlkError::Truncated {
        seed_size,
        data_size: buffer.len(),
    })?;
    Ok(fold_words(u64::MAX, region))
}

fn fold_words(acc: u64, region: &[u8]) -> u64 {
    region.chunks_exact(8).fold(acc, |acc, word| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(word);
        acc ^ u64::from_le_bytes(bytes)
    })
}

fn key_halves(key: &[u8; KEY_SIZE]) -> (u64, u64) {
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&key[..8]);
    high.copy_from_slice(&key[8..]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}

fn random_words(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for chunk in out.chunks_exact_mut(8) {
        chunk.copy_from_slice(&random_u64().to_le_bytes());
    }
    out
}

// ── Codec ────────────────────────────────────────────────────────────────────

pub struct BlkCodec {
    variant: BlkVariant,
    keys: BlkKeys,
}

impl BlkCodec {
    pub fn new(variant: BlkVariant, keys: BlkKeys) -> Self {
        Self { variant, keys }
    }

    pub fn variant(&self) -> BlkVariant {
        self.variant
    }

    /// Parse everything between the magic and the payload.
    pub fn read_header(&self, reader: &mut EndianReader<'_>) -> Result<BlkHeader, BlkError> {
        let count = reader.read_i32()?;
        if count != KEY_SIZE as i32 {
            return Err(BlkError::InvalidKeyLength(count));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(reader.read(KEY_SIZE)?);

        let seed_size = match self.variant {
            BlkVariant::Ec2b => reader.read_i32()? as i64,
            BlkVariant::Blk => {
                reader.skip(KEY_SIZE)?;
                reader.read_i16()? as i64
            }
        };
        let seed_size = seed_size.clamp(0, SEED_BLOCK_SIZE as i64) as usize;
        Ok(BlkHeader { key, seed_size })
    }

    /// Decode a whole container.
    ///
    /// Blk returns the decrypted payload; Ec2b returns the 4096-byte keystream.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BlkError> {
        let mut reader = EndianReader::new(data, Endian::Little);
        let magic = reader.read(4)?;
        if magic != self.variant.magic() {
            return Err(BlkError::InvalidMagic {
                expected: self.variant.magic(),
                found: magic.to_vec(),
            });
        }

        let header = self.read_header(&mut reader)?;
        let mut buffer = reader.read_remaining();
        debug!(
            variant = self.variant.name(),
            seed_size = header.seed_size,
            data_size = buffer.len(),
            "decrypting key blob"
        );

        let key_seed = seed_checksum(&buffer, header.seed_size)?;
        let seed = self.unwrap_seed(header.key, key_seed);
        let pad = xor_pad(seed);

        match self.variant {
            BlkVariant::Ec2b => Ok(pad.to_vec()),
            BlkVariant::Blk => {
                apply_xor_pad(&mut buffer, &pad);
                Ok(buffer)
            }
        }
    }

    /// Build a container whose keystream is derived from `seed`.
    pub fn encrypt(&self, seed: u64, payload: Payload<'_>) -> Result<Vec<u8>, BlkError> {
        let mut buffer = match payload {
            Payload::Data(bytes) => bytes.to_vec(),
            Payload::Random(len) => random_words(len),
        };
        let seed_size = seed_size_for(buffer.len());

        if self.variant == BlkVariant::Blk {
            apply_xor_pad(&mut buffer, &xor_pad(seed));
        }

        let key_seed = seed_checksum(&buffer, seed_size)?;
        let key = self.wrap_seed(seed, key_seed);

        let mut writer = EndianWriter::with_capacity(buffer.len() + 0x30, Endian::Little);
        writer.write_bytes(self.variant.magic());
        writer.write_i32(KEY_SIZE as i32);
        writer.write_bytes(&key);
        match self.variant {
            BlkVariant::Ec2b => writer.write_i32(seed_size as i32),
            BlkVariant::Blk => {
                writer.write_fill(0xFF, KEY_SIZE);
                writer.write_i16(seed_size as i16);
            }
        }
        writer.write_bytes(&buffer);
        Ok(writer.into_inner())
    }

    /// The keystream a container built from `seed` is XORed with.
    pub fn keystream(seed: u64) -> [u8; XOR_PAD_SIZE] {
        xor_pad(seed)
    }

    fn unwrap_seed(&self, mut key: [u8; KEY_SIZE], key_seed: u64) -> u64 {
        self.keys.wrap.unwrap_key(&mut key);
        let (low, high) = key_halves(&key);
        low ^ high ^ key_seed ^ self.keys.const64
    }

    fn wrap_seed(&self, seed: u64, key_seed: u64) -> [u8; KEY_SIZE] {
        let low = random_u64();
        let high = low ^ seed ^ key_seed ^ self.keys.const64;
        let mut key = [0u8; KEY_SIZE];
        key[..8].copy_from_slice(&low.to_le_bytes());
        key[8..].copy_from_slice(&high.to_le_bytes());
        self.keys.wrap.wrap_key(&mut key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SBOX_SIZE;

    fn keys() -> BlkKeys {
        let sbox: Vec<u8> = (0..SBOX_SIZE)
            .map(|i| ((i % 0x100) * 91 + (i / 0x100) * 7) as u8)
            .collect();
        BlkKeys::new(&[0x11; 16], &[0xA5; 16], Some(sbox.as_slice()), 0x0123_4567_89AB_CDEF).unwrap()
    }

    #[test]
    fn seed_size_is_clamped_and_word_aligned() {
        assert_eq!(seed_size_for(5000), 2048);
        assert_eq!(seed_size_for(10), 8);
        assert_eq!(seed_size_for(7), 0);
        assert_eq!(seed_size_for(2048), 2048);
    }

    #[test]
    fn checksum_of_empty_region_is_all_ones() {
        assert_eq!(seed_checksum(&[1, 2, 3], 0).unwrap(), u64::MAX);
    }

    #[test]
    fn checksum_fold_twice_restores_accumulator() {
        let data: Vec<u8> = (0..64u8).collect();
        let once = fold_words(u64::MAX, &data);
        assert_ne!(once, u64::MAX);
        assert_eq!(fold_words(once, &data), u64::MAX);
    }

    #[test]
    fn checksum_rejects_short_buffer() {
        let err = seed_checksum(&[0u8; 8], 16).unwrap_err();
        assert!(matches!(err, BlkError::Truncated { seed_size: 16, data_size: 8 }));
    }

    #[test]
    fn blk_round_trip() {
        let codec = BlkCodec::new(BlkVariant::Blk, keys());
        let plain: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let packed = codec.encrypt(0x5EED, Payload::Data(&plain)).unwrap();

        assert_eq!(&packed[..4], BLK_MAGIC);
        assert_eq!(packed.len(), 4 + 4 + 16 + 16 + 2 + plain.len());
        assert_eq!(&packed[24..40], &[0xFF; 16]);
        assert_eq!(codec.decrypt(&packed).unwrap(), plain);
    }

    #[test]
    fn ec2b_decrypts_to_keystream_of_seed() {
        let codec = BlkCodec::new(BlkVariant::Ec2b, keys());
        let packed = codec.encrypt(42, Payload::Random(2048)).unwrap();
        assert_eq!(&packed[..4], EC2B_MAGIC);
        assert_eq!(packed.len(), 4 + 4 + 16 + 4 + 2048);
        let pad = codec.decrypt(&packed).unwrap();
        assert_eq!(pad, BlkCodec::keystream(42).to_vec());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let codec = BlkCodec::new(BlkVariant::Ec2b, keys());
        let blk = BlkCodec::new(BlkVariant::Blk, keys())
            .encrypt(1, Payload::Data(b"payload"))
            .unwrap();
        assert!(matches!(codec.decrypt(&blk), Err(BlkError::InvalidMagic { .. })));
    }

    #[test]
    fn bad_key_length_is_rejected() {
        let mut w = EndianWriter::new(Endian::Little);
        w.write_bytes(BLK_MAGIC);
        w.write_i32(8);
        w.write_fill(0, 8);
        let codec = BlkCodec::new(BlkVariant::Blk, keys());
        assert!(matches!(codec.decrypt(w.as_slice()), Err(BlkError::InvalidKeyLength(8))));
    }

    #[test]
    fn oversized_seed_field_is_clamped() {
        let mut w = EndianWriter::new(Endian::Little);
        w.write_i32(16);
        w.write_fill(0, 16);
        w.write_i32(0x7000);
        let codec = BlkCodec::new(BlkVariant::Ec2b, keys());
        let mut r = EndianReader::new(w.as_slice(), Endian::Little);
        assert_eq!(codec.read_header(&mut r).unwrap().seed_size, SEED_BLOCK_SIZE);
    }
}
