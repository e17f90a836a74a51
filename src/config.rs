//! Key file handling.
//!
//! Keys are opaque caller-supplied byte buffers stored as hex strings:
//!
//! ```json
//! {
//!   "blk":  { "expansion_key": "…", "const_key": "…", "sbox": "…", "const64": 1234 },
//!   "ec2b": { "expansion_key": "…", "const_key": "…", "const64": 5678 }
//! }
//! ```
//!
//! `sbox` is optional. Sections are only required for the formats that use
//! them.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blk::{BlkKeys, BlkVariant};
use crate::crypto::CryptoError;

pub const DEFAULT_KEY_FILE: &str = "keys.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read key file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Invalid key file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Field '{field}' is not valid hex: {source}")]
    Hex { field: &'static str, source: hex::FromHexError },
    #[error("Key file has no '{0}' section")]
    MissingKeys(&'static str),
    #[error("Invalid key material: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyEntry {
    pub expansion_key: String,
    pub const_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbox: Option<String>,
    pub const64: u64,
}

impl KeyEntry {
    pub fn to_keys(&self) -> Result<BlkKeys, ConfigError> {
        let expansion_key = decode("expansion_key", &self.expansion_key)?;
        let const_key = decode("const_key", &self.const_key)?;
        let sbox = self.sbox.as_deref().map(|s| decode("sbox", s)).transpose()?;
        Ok(BlkKeys::new(&expansion_key, &const_key, sbox.as_deref(), self.const64)?)
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, ConfigError> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(cleaned).map_err(|source| ConfigError::Hex { field, source })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyFile {
    #[serde(default)]
    pub blk: Option<KeyEntry>,
    #[serde(default)]
    pub ec2b: Option<KeyEntry>,
}

impl KeyFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn keys_for(&self, variant: BlkVariant) -> Result<BlkKeys, ConfigError> {
        let entry = match variant {
            BlkVariant::Blk  => self.blk.as_ref(),
            BlkVariant::Ec2b => self.ec2b.as_ref(),
        };
        entry.ok_or(ConfigError::MissingKeys(variant.name()))?.to_keys()
    }
}
