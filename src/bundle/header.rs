use crate::codec::CompressionType;
use crate::cursor::{EndianReader, DEFAULT_MAX_STRING};

use super::BundleError;

pub const UNITYFS_SIGNATURE: &str = "UnityFS";

/// Metadata blob sits at the end of the file instead of after the header.
pub const FLAG_BLOCKS_INFO_AT_END: u32 = 0x80;
/// Storage blocks start on a 16-byte boundary after the metadata blob.
pub const FLAG_BLOCK_INFO_NEEDS_PADDING: u32 = 0x200;

/// Sizes and flags that drive [`super::BundleContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub size: i64,
    pub compressed_blocks_info_size: u32,
    pub uncompressed_blocks_info_size: u32,
    pub flags: u32,
}

impl Header {
    pub fn compression(&self) -> CompressionType {
        CompressionType::from_flags(self.flags)
    }

    pub fn blocks_info_at_end(&self) -> bool {
        self.flags & FLAG_BLOCKS_INFO_AT_END != 0
    }

    pub fn block_info_needs_alignment(&self) -> bool {
        self.flags & FLAG_BLOCK_INFO_NEEDS_PADDING != 0
    }
}

/// Outer header of a UnityFS archive (big-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnityFsHeader {
    pub signature: String,
    pub version: u32,
    pub unity_version: String,
    pub unity_revision: String,
    pub header: Header,
}

impl UnityFsHeader {
    /// Parse the header and leave `reader` at the start of the archive body.
    pub fn read(reader: &mut EndianReader<'_>) -> Result<Self, BundleError> {
        let signature = reader.read_string_to_null(DEFAULT_MAX_STRING)?;
        if signature != UNITYFS_SIGNATURE {
            return Err(BundleError::InvalidSignature(signature));
        }
        let version = reader.read_u32()?;
        let unity_version = reader.read_string_to_null(DEFAULT_MAX_STRING)?;
        let unity_revision = reader.read_string_to_null(DEFAULT_MAX_STRING)?;
        let header = Header {
            size: reader.read_i64()?,
            compressed_blocks_info_size: reader.read_u32()?,
            uncompressed_blocks_info_size: reader.read_u32()?,
            flags: reader.read_u32()?,
        };
        if version >= 7 {
            reader.align(16)?;
        }
        Ok(Self { signature, version, unity_version, unity_revision, header })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Endian, EndianWriter};

    fn write_header(version: u32) -> Vec<u8> {
        let mut w = EndianWriter::new(Endian::Big);
        w.write_string(UNITYFS_SIGNATURE, true);
        w.write_u32(version);
        w.write_string("5.x.x", true);
        w.write_string("2017.4.30f1", true);
        w.write_i64(1234);
        w.write_u32(50);
        w.write_u32(91);
        w.write_u32(0x43);
        w.into_inner()
    }

    #[test]
    fn reads_v6_header() {
        let bytes = write_header(6);
        let mut r = EndianReader::new(&bytes, Endian::Big);
        let h = UnityFsHeader::read(&mut r).unwrap();
        assert_eq!(h.version, 6);
        assert_eq!(h.unity_revision, "2017.4.30f1");
        assert_eq!(h.header.size, 1234);
        assert_eq!(h.header.compressed_blocks_info_size, 50);
        assert_eq!(h.header.uncompressed_blocks_info_size, 91);
        assert_eq!(h.header.compression(), CompressionType::Lz4HC);
        assert!(!h.header.blocks_info_at_end());
        assert_eq!(r.position(), bytes.len());
    }

    #[test]
    fn v7_header_is_aligned() {
        let mut bytes = write_header(7);
        bytes.resize(64, 0);
        let mut r = EndianReader::new(&bytes, Endian::Big);
        UnityFsHeader::read(&mut r).unwrap();
        assert_eq!(r.position() % 16, 0);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut r = EndianReader::new(b"UnityWeb\0\0\0\0\0", Endian::Big);
        assert!(matches!(UnityFsHeader::read(&mut r), Err(BundleError::InvalidSignature(s)) if s == "UnityWeb"));
    }

    #[test]
    fn flag_bits() {
        let h = Header { flags: FLAG_BLOCKS_INFO_AT_END | FLAG_BLOCK_INFO_NEEDS_PADDING | 2, ..Header::default() };
        assert!(h.blocks_info_at_end());
        assert!(h.block_info_needs_alignment());
        assert_eq!(h.compression(), CompressionType::Lz4);
    }
}
