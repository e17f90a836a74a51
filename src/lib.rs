pub mod cursor;
pub mod crypto;
pub mod blk;
pub mod codec;
pub mod bundle;
pub mod config;
pub mod format;

pub use cursor::{Endian, EndianReader, EndianWriter};
pub use blk::{BlkCodec, BlkKeys, BlkVariant, Payload};
pub use codec::{CompressionType, Envelope, decompress, decompress_into};
pub use bundle::{BundleContainer, BundleMetadata, DirectoryEntry, Header, OutputFile, StorageBlock};
pub use config::KeyFile;
pub use format::{Direction, Format, get_format};
