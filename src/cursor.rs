//! Endian-aware byte cursors.
//!
//! [`EndianReader`] borrows the caller's buffer and only tracks a position;
//! nothing is copied unless [`EndianReader::read_bytes`] is asked to.
//! [`EndianWriter`] appends to an owned `Vec<u8>`.
//!
//! Both are parameterised by [`Endian`] at construction time. The Blk/Ec2b
//! containers are little-endian; bundle metadata and headers are big-endian.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

/// Longest NUL-terminated string read when no explicit bound is given.
pub const DEFAULT_MAX_STRING: usize = 0x7FFF;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CursorError {
    #[error("Unexpected end of buffer: needed {needed} bytes at offset {position}, {remaining} remaining")]
    UnexpectedEof { position: usize, needed: usize, remaining: usize },
    #[error("Position {0} is past the end of the buffer")]
    OutOfBounds(usize),
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

// ── Reader ──────────────────────────────────────────────────────────────────

macro_rules! read_int {
    ($name:ident, $ty:ty, $size:expr, $fn:ident) => {
        pub fn $name(&mut self) -> Result<$ty, CursorError> {
            let bytes = self.read($size)?;
            Ok(match self.endian {
                Endian::Little => LittleEndian::$fn(bytes),
                Endian::Big => BigEndian::$fn(bytes),
            })
        }
    };
}

#[derive(Debug, Clone)]
pub struct EndianReader<'a> {
    buffer: &'a [u8],
    position: usize,
    endian: Endian,
}

impl<'a> EndianReader<'a> {
    pub fn new(buffer: &'a [u8], endian: Endian) -> Self {
        Self { buffer, position: 0, endian }
    }

    pub fn endian(&self) -> Endian { self.endian }
    pub fn set_endian(&mut self, endian: Endian) { self.endian = endian; }
    pub fn position(&self) -> usize { self.position }
    pub fn len(&self) -> usize { self.buffer.len() }
    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }
    pub fn remaining(&self) -> usize { self.buffer.len() - self.position }

    pub fn set_position(&mut self, position: usize) -> Result<(), CursorError> {
        if position > self.buffer.len() {
            return Err(CursorError::OutOfBounds(position));
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<(), CursorError> {
        self.read(count).map(|_| ())
    }

    /// Advance to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<(), CursorError> {
        let rem = self.position % alignment;
        if rem != 0 {
            self.skip(alignment - rem)?;
        }
        Ok(())
    }

    /// Borrow exactly `count` bytes and advance past them.
    pub fn read(&mut self, count: usize) -> Result<&'a [u8], CursorError> {
        if count > self.remaining() {
            return Err(CursorError::UnexpectedEof {
                position: self.position,
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// Copy up to `count` bytes, clamped to what is left.
    pub fn read_bytes(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.remaining());
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        slice.to_vec()
    }

    pub fn read_remaining(&mut self) -> Vec<u8> {
        self.read_bytes(self.remaining())
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.read(1)?[0])
    }

    read_int!(read_i16, i16, 2, read_i16);
    read_int!(read_u16, u16, 2, read_u16);
    read_int!(read_i32, i32, 4, read_i32);
    read_int!(read_u32, u32, 4, read_u32);
    read_int!(read_i64, i64, 8, read_i64);
    read_int!(read_u64, u64, 8, read_u64);

    /// Read UTF-8 text up to (not including) a NUL byte, or `max_len` bytes.
    ///
    /// The cursor ends up past the terminator. If no terminator is found
    /// within `max_len` bytes, exactly `max_len` bytes are consumed; if the
    /// buffer ends first, the rest of the buffer is taken as the string.
    pub fn read_string_to_null(&mut self, max_len: usize) -> Result<String, CursorError> {
        let start = self.position;
        let window = &self.buffer[start..];
        let limit = window.len().min(max_len);
        let (text, consumed) = match window[..limit].iter().position(|&b| b == 0) {
            Some(nul) => (&window[..nul], nul + 1),
            None => (&window[..limit], limit),
        };
        let s = std::str::from_utf8(text)
            .map_err(|_| CursorError::InvalidUtf8(start))?
            .to_owned();
        self.position += consumed;
        Ok(s)
    }
}

// ── Writer ──────────────────────────────────────────────────────────────────

macro_rules! write_int {
    ($name:ident, $ty:ty, $size:expr, $fn:ident) => {
        pub fn $name(&mut self, value: $ty) {
            let mut tmp = [0u8; $size];
            match self.endian {
                Endian::Little => LittleEndian::$fn(&mut tmp, value),
                Endian::Big => BigEndian::$fn(&mut tmp, value),
            }
            self.buffer.extend_from_slice(&tmp);
        }
    };
}

#[derive(Debug, Clone, Default)]
pub struct EndianWriter {
    buffer: Vec<u8>,
    endian: Endian,
}

impl EndianWriter {
    pub fn new(endian: Endian) -> Self {
        Self { buffer: Vec::new(), endian }
    }

    pub fn with_capacity(capacity: usize, endian: Endian) -> Self {
        Self { buffer: Vec::with_capacity(capacity), endian }
    }

    pub fn position(&self) -> usize { self.buffer.len() }
    pub fn as_slice(&self) -> &[u8] { &self.buffer }
    pub fn into_inner(self) -> Vec<u8> { self.buffer }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Append `count` copies of `value`.
    pub fn write_fill(&mut self, value: u8, count: usize) {
        self.buffer.resize(self.buffer.len() + count, value);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    write_int!(write_i16, i16, 2, write_i16);
    write_int!(write_u16, u16, 2, write_u16);
    write_int!(write_i32, i32, 4, write_i32);
    write_int!(write_u32, u32, 4, write_u32);
    write_int!(write_i64, i64, 8, write_i64);
    write_int!(write_u64, u64, 8, write_u64);

    pub fn write_string(&mut self, s: &str, terminated: bool) {
        self.buffer.extend_from_slice(s.as_bytes());
        if terminated {
            self.buffer.push(0);
        }
    }

    /// Zero-pad up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let rem = self.buffer.len() % alignment;
        if rem != 0 {
            self.write_fill(0, alignment - rem);
        }
    }
}
