//! Block-compressed bundle extraction.
//!
//! A bundle body is a compressed metadata blob followed by a run of
//! independently compressed storage blocks. Decompressing the blocks in file
//! order and concatenating them gives the *logical payload*; the directory
//! table then slices files out of it by `(offset, size)`. Block boundaries
//! and file boundaries are unrelated.
//!
//! Metadata blob (big-endian, after decompression):
//! ```text
//! [16-byte hash, if present]
//! i32 block_count  { i32 uncompressed, i32 compressed, u16 flags } × block_count
//! i32 node_count   { i64 offset, i64 size, u32 flags, path\0 }     × node_count
//! ```
//!
//! Sizes and offsets are signed on disk; negative values are rejected while
//! parsing.

pub mod header;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::codec::{decompress, decompress_into, CodecError, CompressionType, Envelope};
use crate::cursor::{CursorError, Endian, EndianReader, DEFAULT_MAX_STRING};

pub use header::{Header, UnityFsHeader};

/// Length of the optional hash that precedes the block table.
pub const METADATA_PADDING: usize = 0x10;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Malformed bundle: {0}")]
    Cursor(#[from] CursorError),
    #[error("Negative {what} count: {count}")]
    NegativeCount { what: &'static str, count: i32 },
    #[error("Negative {what}: {value}")]
    NegativeField { what: &'static str, value: i64 },
    #[error("Cannot allocate {size} bytes for the logical payload")]
    Allocation { size: u64 },
    #[error("Entry '{path}' spans {offset}+{size}, past the {payload} byte payload")]
    EntryOutOfRange { path: String, offset: u64, size: u64, payload: usize },
    #[error("Entry path '{0}' has no file name")]
    EmptyFileName(String),
    #[error("Invalid signature: {0:?}")]
    InvalidSignature(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Entities ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBlock {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub flags: u16,
}

impl StorageBlock {
    pub fn compression(&self) -> CompressionType {
        CompressionType::from_flags(self.flags as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path as stored in the archive.
    pub path: String,
    /// Final path segment; directories are not recreated on disk.
    pub file_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleMetadata {
    pub blocks: Vec<StorageBlock>,
    pub directory: Vec<DirectoryEntry>,
}

impl BundleMetadata {
    /// Parse a decompressed metadata blob.
    pub fn parse(blob: &[u8], has_padding: bool) -> Result<Self, BundleError> {
        let mut reader = EndianReader::new(blob, Endian::Big);
        if has_padding {
            reader.skip(METADATA_PADDING)?;
        }

        let block_count = read_count(&mut reader, "block")?;
        let mut blocks = Vec::with_capacity(block_count.min(reader.remaining() / 10));
        for _ in 0..block_count {
            blocks.push(StorageBlock {
                uncompressed_size: read_size32(&mut reader, "uncompressed block size")?,
                compressed_size: read_size32(&mut reader, "compressed block size")?,
                flags: reader.read_u16()?,
            });
        }

        let node_count = read_count(&mut reader, "directory")?;
        let mut directory = Vec::with_capacity(node_count.min(reader.remaining() / 21));
        for _ in 0..node_count {
            directory.push(DirectoryEntry {
                offset: read_size64(&mut reader, "entry offset")?,
                size: read_size64(&mut reader, "entry size")?,
                flags: reader.read_u32()?,
                path: reader.read_string_to_null(DEFAULT_MAX_STRING)?,
            });
        }

        Ok(Self { blocks, directory })
    }

    /// Length of the logical payload.
    pub fn payload_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.uncompressed_size as u64).sum()
    }
}

fn read_count(reader: &mut EndianReader<'_>, what: &'static str) -> Result<usize, BundleError> {
    let count = reader.read_i32()?;
    usize::try_from(count).map_err(|_| BundleError::NegativeCount { what, count })
}

fn read_size32(reader: &mut EndianReader<'_>, what: &'static str) -> Result<u32, BundleError> {
    let value = reader.read_i32()?;
    u32::try_from(value).map_err(|_| BundleError::NegativeField { what, value: value.into() })
}

fn read_size64(reader: &mut EndianReader<'_>, what: &'static str) -> Result<u64, BundleError> {
    let value = reader.read_i64()?;
    u64::try_from(value).map_err(|_| BundleError::NegativeField { what, value })
}

// ── Container ────────────────────────────────────────────────────────────────

pub struct BundleContainer<'e> {
    header: Header,
    has_padding: bool,
    envelope: Option<&'e dyn Envelope>,
}

impl<'e> BundleContainer<'e> {
    pub fn new(header: Header, has_padding: bool) -> Self {
        Self { header, has_padding, envelope: None }
    }

    /// Decryptor for `Lz4Mr0k` regions.
    pub fn with_envelope(mut self, envelope: &'e dyn Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Extract every file into `output`. Returns the written paths.
    pub fn process(&self, reader: &mut EndianReader<'_>, output: &Path) -> Result<Vec<PathBuf>, BundleError> {
        let files = self.extract(reader)?;
        Ok(write_files(&files, output)?)
    }

    /// Decode the archive into memory without touching the filesystem.
    pub fn extract(&self, reader: &mut EndianReader<'_>) -> Result<Vec<OutputFile>, BundleError> {
        let metadata = if self.header.blocks_info_at_end() {
            let resume = reader.position();
            let at = reader
                .len()
                .checked_sub(self.header.compressed_blocks_info_size as usize)
                .ok_or(CursorError::OutOfBounds(self.header.compressed_blocks_info_size as usize))?;
            reader.set_position(at)?;
            let metadata = self.read_metadata(reader)?;
            reader.set_position(resume)?;
            metadata
        } else {
            self.read_metadata(reader)?
        };
        if self.header.block_info_needs_alignment() {
            reader.align(16)?;
        }

        let payload = self.read_blocks(reader, &metadata.blocks)?;
        read_nodes(&payload, &metadata.directory)
    }

    /// Read and decompress the metadata blob, then parse its two tables.
    pub fn read_metadata(&self, reader: &mut EndianReader<'_>) -> Result<BundleMetadata, BundleError> {
        let mut compressed = reader.read(self.header.compressed_blocks_info_size as usize)?.to_vec();
        let blob = decompress(
            self.header.compression(),
            &mut compressed,
            self.header.uncompressed_blocks_info_size as usize,
            self.envelope,
        )?;
        let metadata = BundleMetadata::parse(&blob, self.has_padding)?;
        debug!(
            blocks = metadata.blocks.len(),
            entries = metadata.directory.len(),
            payload = metadata.payload_size(),
            "parsed bundle metadata"
        );
        Ok(metadata)
    }

    /// Decompress `blocks` in order into one logical payload.
    ///
    /// The payload grows one block at a time, after that block's compressed
    /// bytes were read.
    pub fn read_blocks(&self, reader: &mut EndianReader<'_>, blocks: &[StorageBlock]) -> Result<Vec<u8>, BundleError> {
        let max_compressed = blocks.iter().map(|b| b.compressed_size as usize).max().unwrap_or(0);
        let mut payload: Vec<u8> = Vec::new();
        let mut scratch = Vec::with_capacity(max_compressed.min(reader.remaining()));

        for (i, block) in blocks.iter().enumerate() {
            scratch.clear();
            scratch.extend_from_slice(reader.read(block.compressed_size as usize)?);

            let start = payload.len();
            let size = block.uncompressed_size as usize;
            payload
                .try_reserve_exact(size)
                .map_err(|_| BundleError::Allocation { size: start as u64 + size as u64 })?;
            payload.resize(start + size, 0);
            decompress_into(block.compression(), &mut scratch, &mut payload[start..], self.envelope)?;
            debug!(
                block = i,
                compression = block.compression().name(),
                compressed = block.compressed_size,
                uncompressed = block.uncompressed_size,
                "decoded storage block"
            );
        }
        Ok(payload)
    }
}

// ── Nodes & output ───────────────────────────────────────────────────────────

/// Final segment of an archive path; both separators are honoured.
pub fn flatten_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Slice each directory entry out of the logical payload.
pub fn read_nodes(payload: &[u8], directory: &[DirectoryEntry]) -> Result<Vec<OutputFile>, BundleError> {
    directory
        .iter()
        .map(|entry| {
            let out_of_range = || BundleError::EntryOutOfRange {
                path: entry.path.clone(),
                offset: entry.offset,
                size: entry.size,
                payload: payload.len(),
            };
            let start = usize::try_from(entry.offset).map_err(|_| out_of_range())?;
            let len = usize::try_from(entry.size).map_err(|_| out_of_range())?;
            let data = start
                .checked_add(len)
                .and_then(|end| payload.get(start..end))
                .ok_or_else(out_of_range)?;

            let file_name = flatten_name(&entry.path);
            if file_name.is_empty() {
                return Err(BundleError::EmptyFileName(entry.path.clone()));
            }
            Ok(OutputFile {
                path: entry.path.clone(),
                file_name: file_name.to_owned(),
                data: data.to_vec(),
            })
        })
        .collect()
}

/// Write each file as `output/<file_name>`, creating `output` if needed and
/// overwriting existing files.
pub fn write_files(files: &[OutputFile], output: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(output)?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let path = output.join(&file.file_name);
        File::create(&path)?.write_all(&file.data)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::EndianWriter;

    fn entry(offset: u64, size: u64, path: &str) -> DirectoryEntry {
        DirectoryEntry { offset, size, flags: 4, path: path.to_owned() }
    }

    #[test]
    fn flatten_keeps_last_segment() {
        assert_eq!(flatten_name("a/b/c.bin"), "c.bin");
        assert_eq!(flatten_name("c.bin"), "c.bin");
        assert_eq!(flatten_name("a\\c.bin"), "c.bin");
        assert_eq!(flatten_name("a/"), "");
    }

    #[test]
    fn nodes_slice_payload_and_drop_directories() {
        let payload: Vec<u8> = (0..100u8).collect();
        let files = read_nodes(&payload, &[entry(0, 40, "a/x.bin"), entry(40, 60, "y.bin")]).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_name, "x.bin");
        assert_eq!(files[0].path, "a/x.bin");
        assert_eq!(files[0].data, payload[..40].to_vec());
        assert_eq!(files[1].file_name, "y.bin");
        assert_eq!(files[1].data, payload[40..].to_vec());
    }

    #[test]
    fn node_past_payload_is_rejected() {
        let payload = [0u8; 10];
        let err = read_nodes(&payload, &[entry(5, 6, "z.bin")]).unwrap_err();
        assert!(matches!(err, BundleError::EntryOutOfRange { offset: 5, size: 6, payload: 10, .. }));
        let err = read_nodes(&payload, &[entry(u64::MAX, 2, "z.bin")]).unwrap_err();
        assert!(matches!(err, BundleError::EntryOutOfRange { .. }));
    }

    #[test]
    fn node_without_file_name_is_rejected() {
        let err = read_nodes(&[0u8; 4], &[entry(0, 4, "dir/")]).unwrap_err();
        assert!(matches!(err, BundleError::EmptyFileName(_)));
    }

    #[test]
    fn metadata_parses_with_and_without_padding() {
        let mut w = EndianWriter::new(Endian::Big);
        w.write_i32(1);
        w.write_u32(32);
        w.write_u32(20);
        w.write_u16(2);
        w.write_i32(1);
        w.write_i64(0);
        w.write_i64(32);
        w.write_u32(4);
        w.write_string("dir/file.dat", true);
        let body = w.into_inner();

        let plain = BundleMetadata::parse(&body, false).unwrap();
        assert_eq!(plain.blocks, vec![StorageBlock { uncompressed_size: 32, compressed_size: 20, flags: 2 }]);
        assert_eq!(plain.directory, vec![entry(0, 32, "dir/file.dat")]);
        assert_eq!(plain.payload_size(), 32);

        let mut padded = vec![0xAB; METADATA_PADDING];
        padded.extend_from_slice(&body);
        assert_eq!(BundleMetadata::parse(&padded, true).unwrap(), plain);
    }

    #[test]
    fn negative_count_is_rejected() {
        let mut w = EndianWriter::new(Endian::Big);
        w.write_i32(-1);
        let err = BundleMetadata::parse(w.as_slice(), false).unwrap_err();
        assert!(matches!(err, BundleError::NegativeCount { what: "block", count: -1 }));
    }

    #[test]
    fn negative_sizes_are_rejected() {
        let mut w = EndianWriter::new(Endian::Big);
        w.write_i32(1);
        w.write_i32(-16);
        w.write_i32(20);
        w.write_u16(2);
        let err = BundleMetadata::parse(w.as_slice(), false).unwrap_err();
        assert!(matches!(err, BundleError::NegativeField { what: "uncompressed block size", value: -16 }));

        let mut w = EndianWriter::new(Endian::Big);
        w.write_i32(0);
        w.write_i32(1);
        w.write_i64(0);
        w.write_i64(-1);
        w.write_u32(4);
        w.write_string("a.bin", true);
        let err = BundleMetadata::parse(w.as_slice(), false).unwrap_err();
        assert!(matches!(err, BundleError::NegativeField { what: "entry size", value: -1 }));
    }

    #[test]
    fn huge_declared_sizes_without_body_fail_cleanly() {
        let blocks = vec![StorageBlock { uncompressed_size: u32::MAX, compressed_size: 16, flags: 2 }; 3000];
        let mut reader = EndianReader::new(&[], Endian::Big);
        let err = BundleContainer::new(Header::default(), false)
            .read_blocks(&mut reader, &blocks)
            .unwrap_err();
        assert!(matches!(err, BundleError::Cursor(CursorError::UnexpectedEof { .. })));
    }

    #[test]
    fn truncated_metadata_is_rejected() {
        let mut w = EndianWriter::new(Endian::Big);
        w.write_i32(3);
        w.write_u32(1);
        assert!(matches!(BundleMetadata::parse(w.as_slice(), false), Err(BundleError::Cursor(_))));
    }
}
