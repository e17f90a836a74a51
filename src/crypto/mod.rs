//! Cryptographic primitives shared by the Blk/Ec2b codec.
//!
//! Key wrap:   sbox lookup → AES-decrypt (single 16-byte block) → XOR const key
//! Key unwrap is the exact inverse, applied in the opposite order.
//! Keystream:  MT19937-64 seeded with one `u64`, 512 outputs written LE (4 KiB)
//!
//! The AES key is supplied by the caller as opaque bytes; its length picks
//! AES-128, AES-192 or AES-256.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use rand_mt::Mt64;
use thiserror::Error;

/// Length of a wrapped/unwrapped key and of one AES block.
pub const KEY_SIZE: usize = 0x10;
/// Length of the substitution box: four 256-entry slices.
pub const SBOX_SIZE: usize = 0x400;
/// Length of the XOR keystream block.
pub const XOR_PAD_SIZE: usize = 0x1000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AES key must be 16, 24 or 32 bytes, got {0}")]
    InvalidCipherKey(usize),
    #[error("Constant key must be {KEY_SIZE} bytes, got {0}")]
    InvalidConstKey(usize),
    #[error("Substitution box must be {SBOX_SIZE} bytes, got {0}")]
    InvalidSbox(usize),
}

// ── Block cipher ─────────────────────────────────────────────────────────────

enum CipherImpl {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

/// One-block AES under a caller-supplied key.
pub struct BlockCipher(CipherImpl);

impl BlockCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidCipherKey(key.len());
        let inner = match key.len() {
            16 => CipherImpl::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            24 => CipherImpl::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            32 => CipherImpl::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
            n  => return Err(CryptoError::InvalidCipherKey(n)),
        };
        Ok(Self(inner))
    }

    pub fn encrypt_block(&self, block: &mut [u8; KEY_SIZE]) {
        let block = Block::from_mut_slice(block);
        match &self.0 {
            CipherImpl::Aes128(c) => c.encrypt_block(block),
            CipherImpl::Aes192(c) => c.encrypt_block(block),
            CipherImpl::Aes256(c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; KEY_SIZE]) {
        let block = Block::from_mut_slice(block);
        match &self.0 {
            CipherImpl::Aes128(c) => c.decrypt_block(block),
            CipherImpl::Aes192(c) => c.decrypt_block(block),
            CipherImpl::Aes256(c) => c.decrypt_block(block),
        }
    }
}

// ── Substitution box ─────────────────────────────────────────────────────────

/// Four 256-entry byte substitution tables with a precomputed inverse.
#[derive(Clone)]
pub struct SubstitutionBox {
    forward: Box<[u8; SBOX_SIZE]>,
    inverse: Box<[u8; SBOX_SIZE]>,
}

impl SubstitutionBox {
    pub fn new(table: &[u8]) -> Result<Self, CryptoError> {
        let forward: [u8; SBOX_SIZE] = table
            .try_into()
            .map_err(|_| CryptoError::InvalidSbox(table.len()))?;

        // Values missing from a slice invert to 0xFF; when a value repeats,
        // the lowest index wins, so fill from the top down.
        let mut inverse = [0xFFu8; SBOX_SIZE];
        for slice in 0..4 {
            let base = slice * 0x100;
            for index in (0..0x100).rev() {
                let value = forward[base + index] as usize;
                inverse[base + value] = index as u8;
            }
        }

        Ok(Self { forward: Box::new(forward), inverse: Box::new(inverse) })
    }

    /// `table[(i % 4) * 256 + byte]`
    #[inline]
    pub fn substitute(&self, i: usize, byte: u8) -> u8 {
        self.forward[(i % 4) * 0x100 + byte as usize]
    }

    /// Position of `byte` within the `(i % 4)`-th slice.
    #[inline]
    pub fn invert(&self, i: usize, byte: u8) -> u8 {
        self.inverse[(i % 4) * 0x100 + byte as usize]
    }
}

impl std::fmt::Debug for SubstitutionBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubstitutionBox").finish_non_exhaustive()
    }
}

// ── Key wrap ─────────────────────────────────────────────────────────────────

/// Obfuscation applied to the 16-byte key stored in a container header.
pub struct KeyWrap {
    cipher: BlockCipher,
    const_key: [u8; KEY_SIZE],
    sbox: Option<SubstitutionBox>,
}

impl KeyWrap {
    pub fn new(expansion_key: &[u8], const_key: &[u8], sbox: Option<&[u8]>) -> Result<Self, CryptoError> {
        let const_key: [u8; KEY_SIZE] = const_key
            .try_into()
            .map_err(|_| CryptoError::InvalidConstKey(const_key.len()))?;
        Ok(Self {
            cipher: BlockCipher::new(expansion_key)?,
            const_key,
            sbox: sbox.map(SubstitutionBox::new).transpose()?,
        })
    }

    /// Recover the usable key from its stored form.
    pub fn unwrap_key(&self, key: &mut [u8; KEY_SIZE]) {
        if let Some(sbox) = &self.sbox {
            for (i, b) in key.iter_mut().enumerate() {
                *b = sbox.substitute(i, *b);
            }
        }
        self.cipher.decrypt_block(key);
        for (b, c) in key.iter_mut().zip(self.const_key.iter()) {
            *b ^= c;
        }
    }

    /// Inverse of [`KeyWrap::unwrap_key`].
    pub fn wrap_key(&self, key: &mut [u8; KEY_SIZE]) {
        for (b, c) in key.iter_mut().zip(self.const_key.iter()) {
            *b ^= c;
        }
        self.cipher.encrypt_block(key);
        if let Some(sbox) = &self.sbox {
            for (i, b) in key.iter_mut().enumerate() {
                *b = sbox.invert(i, *b);
            }
        }
    }
}

// ── Keystream ────────────────────────────────────────────────────────────────

/// Fill a 4 KiB pad from MT19937-64 seeded with `seed`.
pub fn xor_pad(seed: u64) -> [u8; XOR_PAD_SIZE] {
    let mut rng = Mt64::new(seed);
    let mut pad = [0u8; XOR_PAD_SIZE];
    for chunk in pad.chunks_exact_mut(8) {
        chunk.copy_from_slice(&rng.next_u64().to_le_bytes());
    }
    pad
}

/// `data[i] ^= pad[i % 4096]`. Self-inverse.
pub fn apply_xor_pad(data: &mut [u8], pad: &[u8; XOR_PAD_SIZE]) {
    for chunk in data.chunks_mut(XOR_PAD_SIZE) {
        for (b, p) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= p;
        }
    }
}

/// A `u64` with no cryptographic requirements; used for filler and key halves.
pub fn random_u64() -> u64 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sbox() -> Vec<u8> {
        (0..SBOX_SIZE)
            .map(|i| ((i % 0x100) * 167 + (i / 0x100) * 13) as u8)
            .collect()
    }

    #[test]
    fn aes128_fips197_vector() {
        let key: Vec<u8> = (0u8..16).collect();
        let cipher = BlockCipher::new(&key).unwrap();
        let mut block = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
            0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ];
        cipher.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
        cipher.decrypt_block(&mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn rejects_bad_key_lengths() {
        assert_eq!(BlockCipher::new(&[0u8; 15]).err(), Some(CryptoError::InvalidCipherKey(15)));
        assert!(KeyWrap::new(&[0u8; 16], &[0u8; 8], None).is_err());
        assert!(SubstitutionBox::new(&[0u8; 100]).is_err());
    }

    #[test]
    fn sbox_inverse_undoes_forward() {
        let sbox = SubstitutionBox::new(&test_sbox()).unwrap();
        for i in 0..16 {
            for b in 0..=255u8 {
                assert_eq!(sbox.invert(i, sbox.substitute(i, b)), b);
            }
        }
    }

    #[test]
    fn sbox_missing_value_inverts_to_ff() {
        let mut table = test_sbox();
        // Slice 0 maps everything to 7: only 7 is present, at index 0.
        table[..0x100].fill(7);
        let sbox = SubstitutionBox::new(&table).unwrap();
        assert_eq!(sbox.invert(0, 7), 0);
        assert_eq!(sbox.invert(4, 8), 0xFF);
    }

    #[test]
    fn key_wrap_round_trip() {
        let sbox = test_sbox();
        let wrap = KeyWrap::new(&[0x42; 16], &[0x5A; 16], Some(sbox.as_slice())).unwrap();
        let original: [u8; KEY_SIZE] = *b"0123456789abcdef";
        let mut key = original;
        wrap.wrap_key(&mut key);
        assert_ne!(key, original);
        wrap.unwrap_key(&mut key);
        assert_eq!(key, original);
    }

    #[test]
    fn keystream_matches_reference_mt19937_64() {
        // First output of the reference generator for the default seed.
        let pad = xor_pad(5489);
        assert_eq!(&pad[..8], &14514284786278117030u64.to_le_bytes());
    }

    #[test]
    fn keystream_is_deterministic() {
        assert_eq!(xor_pad(0xDEAD_BEEF), xor_pad(0xDEAD_BEEF));
        assert_ne!(xor_pad(1)[..], xor_pad(2)[..]);
    }

    #[test]
    fn xor_pad_wraps_every_4k() {
        let pad = xor_pad(7);
        let mut data = vec![0u8; XOR_PAD_SIZE + 3];
        apply_xor_pad(&mut data, &pad);
        assert_eq!(&data[..XOR_PAD_SIZE], &pad[..]);
        assert_eq!(&data[XOR_PAD_SIZE..], &pad[..3]);
        apply_xor_pad(&mut data, &pad);
        assert!(data.iter().all(|&b| b == 0));
    }
}
