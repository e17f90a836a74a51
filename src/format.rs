//! Static format registry and per-file processing.
//!
//! Each [`Format`] names a container kind and the file extensions it reads
//! and writes in each direction. A direction with no extensions is
//! unsupported for that format.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::blk::{BlkCodec, BlkError, BlkVariant, Payload};
use crate::bundle::{BundleContainer, BundleError, UnityFsHeader};
use crate::codec::Envelope;
use crate::config::{ConfigError, KeyFile};
use crate::crypto::random_u64;
use crate::cursor::{Endian, EndianReader};

/// Payload size of a freshly generated Ec2b blob.
pub const EC2B_DATA_SIZE: usize = 0x800;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid format '{0}'")]
    UnknownFormat(String),
    #[error("Format '{format}' does not support {direction}")]
    Unsupported { format: &'static str, direction: Direction },
    #[error("Invalid seed '{0}': expected a decimal or 0x-prefixed hex u64")]
    InvalidSeed(String),
    #[error(transparent)]
    Blk(#[from] BlkError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Decrypt,
    Encrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Decrypt => "decrypt",
            Direction::Encrypt => "encrypt",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Blk,
    Ec2b,
    Bundle,
}

impl FormatKind {
    pub fn needs_keys(self) -> bool {
        !matches!(self, FormatKind::Bundle)
    }
}

/// Input and output extensions for one direction, without the dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions {
    pub input: &'static str,
    pub output: &'static str,
}

#[derive(Debug)]
pub struct Format {
    pub name: &'static str,
    pub display_name: &'static str,
    pub kind: FormatKind,
    pub decrypt: Option<Extensions>,
    pub encrypt: Option<Extensions>,
}

pub static FORMATS: &[Format] = &[
    Format {
        name: "blk",
        display_name: "Blk key-stream container",
        kind: FormatKind::Blk,
        decrypt: Some(Extensions { input: "blk", output: "bin" }),
        encrypt: Some(Extensions { input: "bin", output: "blk" }),
    },
    Format {
        name: "ec2b",
        display_name: "Ec2b key blob",
        kind: FormatKind::Ec2b,
        decrypt: Some(Extensions { input: "ec2b", output: "key" }),
        encrypt: Some(Extensions { input: "seed", output: "ec2b" }),
    },
    Format {
        name: "bundle",
        display_name: "UnityFS block-compressed bundle",
        kind: FormatKind::Bundle,
        decrypt: Some(Extensions { input: "unity3d", output: "" }),
        encrypt: None,
    },
];

/// Look up a format by name (case-insensitive).
pub fn get_format(name: &str) -> Result<&'static Format, FormatError> {
    FORMATS
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| FormatError::UnknownFormat(name.to_owned()))
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.display_name)
    }
}

impl Format {
    pub fn extensions(&self, direction: Direction) -> Option<Extensions> {
        match direction {
            Direction::Decrypt => self.decrypt,
            Direction::Encrypt => self.encrypt,
        }
    }

    pub fn supports(&self, direction: Direction) -> bool {
        self.extensions(direction).is_some()
    }

    fn require(&self, direction: Direction) -> Result<Extensions, FormatError> {
        self.extensions(direction)
            .ok_or(FormatError::Unsupported { format: self.name, direction })
    }

    /// Pair every input with its output path.
    ///
    /// A file input maps straight to `output`. A directory is walked
    /// recursively; matching files keep their relative path under `output`
    /// with the extension swapped. Bundle outputs are directories named
    /// after the input file.
    pub fn collect_paths(&self, input: &Path, output: &Path, direction: Direction) -> Result<Vec<(PathBuf, PathBuf)>, FormatError> {
        let ext = self.require(direction)?;
        if input.is_file() {
            return Ok(vec![(input.to_owned(), output.to_owned())]);
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(Result::ok) {
            let path = entry.path();
            let matches = entry.file_type().is_file()
                && path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext.input));
            if !matches {
                continue;
            }
            let relative = path.strip_prefix(input).unwrap_or(path);
            let target = output.join(relative).with_extension(ext.output);
            paths.push((path.to_owned(), target));
        }
        Ok(paths)
    }

    /// Process one input file. `keys` must be present for formats that need them.
    pub fn process_file(&self, input: &Path, output: &Path, direction: Direction, keys: Option<&KeyFile>) -> Result<(), FormatError> {
        self.process_file_with_envelope(input, output, direction, keys, None)
    }

    /// Like [`Format::process_file`], with a decryptor for `Lz4Mr0k` bundle
    /// blocks. Without one, enveloped blocks fail with
    /// `CodecError::EnvelopeUnavailable`.
    pub fn process_file_with_envelope(
        &self,
        input: &Path,
        output: &Path,
        direction: Direction,
        keys: Option<&KeyFile>,
        envelope: Option<&dyn Envelope>,
    ) -> Result<(), FormatError> {
        self.require(direction)?;
        debug!(format = self.name, %direction, input = %input.display(), "processing");

        match self.kind {
            FormatKind::Blk | FormatKind::Ec2b => {
                let variant = if self.kind == FormatKind::Blk { BlkVariant::Blk } else { BlkVariant::Ec2b };
                let keys = keys.ok_or(ConfigError::MissingKeys(variant.name()))?;
                let codec = BlkCodec::new(variant, keys.keys_for(variant)?);
                let data = fs::read(input)?;
                let buffer = match (direction, variant) {
                    (Direction::Decrypt, _) => codec.decrypt(&data)?,
                    (Direction::Encrypt, BlkVariant::Blk) => codec.encrypt(random_u64(), Payload::Data(&data))?,
                    (Direction::Encrypt, BlkVariant::Ec2b) => {
                        let seed = parse_seed(&String::from_utf8_lossy(&data))?;
                        codec.encrypt(seed, Payload::Random(EC2B_DATA_SIZE))?
                    }
                };
                write_output(output, &buffer)
            }
            FormatKind::Bundle => {
                let data = fs::read(input)?;
                let mut reader = EndianReader::new(&data, Endian::Big);
                let header = UnityFsHeader::read(&mut reader)?;
                debug!(version = header.version, revision = %header.unity_revision, "read UnityFS header");
                let container = BundleContainer::new(header.header, true);
                let container = match envelope {
                    Some(envelope) => container.with_envelope(envelope),
                    None => container,
                };
                container.process(&mut reader, output)?;
                Ok(())
            }
        }
    }
}

/// Parse a seed written as decimal or `0x`-prefixed hex.
pub fn parse_seed(text: &str) -> Result<u64, FormatError> {
    let trimmed = text.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| FormatError::InvalidSeed(trimmed.to_owned()))
}

fn write_output(output: &Path, buffer: &[u8]) -> Result<(), FormatError> {
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(output, buffer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(get_format("BLK").unwrap().kind, FormatKind::Blk);
        assert!(matches!(get_format("cb9"), Err(FormatError::UnknownFormat(n)) if n == "cb9"));
    }

    #[test]
    fn bundle_cannot_encrypt() {
        let bundle = get_format("bundle").unwrap();
        assert!(bundle.supports(Direction::Decrypt));
        assert!(!bundle.supports(Direction::Encrypt));
        let err = bundle
            .process_file(Path::new("a"), Path::new("b"), Direction::Encrypt, None)
            .unwrap_err();
        assert!(matches!(err, FormatError::Unsupported { format: "bundle", direction: Direction::Encrypt }));
        let err = bundle
            .collect_paths(Path::new("a"), Path::new("b"), Direction::Encrypt)
            .unwrap_err();
        assert!(matches!(err, FormatError::Unsupported { format: "bundle", direction: Direction::Encrypt }));
    }

    #[test]
    fn seeds_parse_in_both_radixes() {
        assert_eq!(parse_seed("42\n").unwrap(), 42);
        assert_eq!(parse_seed("0xFF").unwrap(), 255);
        assert!(parse_seed("seed").is_err());
    }

    #[test]
    fn collects_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(input.join("sub")).unwrap();
        fs::write(input.join("a.blk"), b"x").unwrap();
        fs::write(input.join("sub/b.BLK"), b"x").unwrap();
        fs::write(input.join("c.txt"), b"x").unwrap();

        let out = dir.path().join("out");
        let blk = get_format("blk").unwrap();
        let paths = blk.collect_paths(&input, &out, Direction::Decrypt).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], (input.join("a.blk"), out.join("a.bin")));
        assert_eq!(paths[1], (input.join("sub/b.BLK"), out.join("sub/b.bin")));
    }

    #[test]
    fn single_file_maps_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.blk");
        fs::write(&file, b"x").unwrap();
        let paths = get_format("blk").unwrap()
            .collect_paths(&file, Path::new("dest.bin"), Direction::Decrypt)
            .unwrap();
        assert_eq!(paths, vec![(file, PathBuf::from("dest.bin"))]);
    }
}
