//! RAM file format
//!
//! # Layout (big-endian)
//!
//! ```text
//! header (32 bytes):
//!   magic("QRAM", 4) + version(4) + index_offset(8) + index_len(8)
//!   + index_crc32(4) + reserved(4)
//! page data, starting at offset 32
//! index, at index_offset:
//!   flags(4) + codec_id_len(1) + codec_id + total_pages(8) + block_count(4)
//!   per block:
//!     id_len(2) + id + page_count(8) + page_size(4) + flags(4)
//!     + path_len(2) + path + pages_stored(1)
//!     per page (only when pages_stored):
//!       varint size_on_disk; when non-zero: file_pos(8) + xxh3_64(8)
//! ```
//!
//! The header is written last. A file whose `index_offset` is zero was never
//! finished and is rejected.

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use quicksnap_core::{FailureReason, RamBlockFlags};

use crate::codec::CodecError;

/// Magic bytes at the start of every RAM file
pub const RAM_FILE_MAGIC: &[u8; 4] = b"QRAM";

/// Current format version
pub const RAM_FILE_VERSION: u32 = 1;

/// Size of the fixed header
pub const RAM_FILE_HEADER_SIZE: usize = 32;

bitflags! {
    /// Whole-file flags stored in the index
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexFlags: u32 {
        /// Blocks mapped shared from a file are stored by reference
        const SEPARATE_BACKING_STORE = 1 << 0;
    }
}

/// Errors reading or writing a RAM file
#[derive(Debug, thiserror::Error)]
pub enum RamFormatError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header magic mismatch
    #[error("Bad magic: expected QRAM, got {0:?}")]
    BadMagic([u8; 4]),

    /// Written by an unsupported version
    #[error("Unsupported RAM file version: {0}")]
    UnsupportedVersion(u32),

    /// Header never finalized
    #[error("RAM file is incomplete (no index)")]
    Incomplete,

    /// Data ended early
    #[error("RAM file truncated: {0}")]
    Truncated(String),

    /// Index checksum mismatch
    #[error("Index CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC stored in the header
        expected: u32,
        /// CRC computed over the index bytes
        actual: u32,
    },

    /// Saved block has no registered counterpart
    #[error("Unknown RAM block: {0}")]
    UnknownBlock(String),

    /// Saved and registered block shapes differ
    #[error("Block {id} geometry mismatch: saved {saved_pages}x{saved_page_size}, registered {registered_size} bytes / {registered_page_size}")]
    GeometryMismatch {
        /// Block name
        id: String,
        /// Saved page count
        saved_pages: u64,
        /// Saved page size
        saved_page_size: u32,
        /// Registered block size
        registered_size: u64,
        /// Registered page size
        registered_page_size: u32,
    },

    /// Page content hash mismatch
    #[error("Page {page} of block {block} failed hash check")]
    HashMismatch {
        /// Block name
        block: String,
        /// Page index within the block
        page: u64,
    },

    /// Codec failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RamFormatError {
    /// Failure reason recorded when this error aborts a load
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            RamFormatError::Io(e) => FailureReason::from_io_error(e),
            RamFormatError::UnsupportedVersion(_) => FailureReason::IncompatibleVersion,
            RamFormatError::UnknownBlock(_) | RamFormatError::GeometryMismatch { .. } => {
                FailureReason::ConfigMismatchAvd
            }
            RamFormatError::Codec(CodecError::UnknownCodec(_)) => FailureReason::IncompatibleVersion,
            _ => FailureReason::CorruptedData,
        }
    }
}

/// Fixed-size file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RamFileHeader {
    /// Format version
    pub version: u32,
    /// Absolute offset of the index
    pub index_offset: u64,
    /// Index length in bytes
    pub index_len: u64,
    /// CRC32 of the index bytes
    pub index_crc32: u32,
}

impl RamFileHeader {
    /// Serialize to exactly [`RAM_FILE_HEADER_SIZE`] bytes
    pub fn to_bytes(&self) -> [u8; RAM_FILE_HEADER_SIZE] {
        let mut buf = [0u8; RAM_FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(RAM_FILE_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..16].copy_from_slice(&self.index_offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.index_len.to_be_bytes());
        buf[24..28].copy_from_slice(&self.index_crc32.to_be_bytes());
        buf
    }

    /// Parse and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RamFormatError> {
        if bytes.len() < RAM_FILE_HEADER_SIZE {
            return Err(RamFormatError::Truncated(format!(
                "header is {} bytes",
                bytes.len()
            )));
        }
        let mut rdr = bytes;
        let mut magic = [0u8; 4];
        rdr.read_exact(&mut magic)?;
        if &magic != RAM_FILE_MAGIC {
            return Err(RamFormatError::BadMagic(magic));
        }
        let version = rdr.read_u32::<BigEndian>()?;
        if version != RAM_FILE_VERSION {
            return Err(RamFormatError::UnsupportedVersion(version));
        }
        let header = RamFileHeader {
            version,
            index_offset: rdr.read_u64::<BigEndian>()?,
            index_len: rdr.read_u64::<BigEndian>()?,
            index_crc32: rdr.read_u32::<BigEndian>()?,
        };
        if header.index_offset == 0 {
            return Err(RamFormatError::Incomplete);
        }
        Ok(header)
    }
}

/// Index entry for one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageEntry {
    /// Bytes on disk; zero means the page is all zeroes and has no data
    pub size_on_disk: u32,
    /// Absolute file offset of the page data
    pub file_pos: u64,
    /// xxh3-64 of the uncompressed page contents
    pub hash: u64,
}

impl PageEntry {
    /// Entry for an elided zero page
    pub const ZERO: PageEntry = PageEntry {
        size_on_disk: 0,
        file_pos: 0,
        hash: 0,
    };

    /// True if the page was elided as all zeroes
    pub fn is_zero(&self) -> bool {
        self.size_on_disk == 0
    }
}

/// Index entry for one RAM block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    /// Block name
    pub id: String,
    /// Number of pages in the block
    pub page_count: u64,
    /// Page size
    pub page_size: u32,
    /// Flags as registered at save time
    pub flags: RamBlockFlags,
    /// Host-portable backing path
    pub path: String,
    /// Per-page entries; empty when the block's contents were not stored
    pub pages: Vec<PageEntry>,
    /// Whether `pages` describes stored contents
    pub pages_stored: bool,
}

/// Index at the end of a RAM file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileIndex {
    /// Whole-file flags
    pub flags: IndexFlags,
    /// Codec used for non-zero pages
    pub codec_id: String,
    /// Sum of `page_count` over all blocks
    pub total_pages: u64,
    /// Blocks in registration order
    pub blocks: Vec<IndexBlock>,
}

impl FileIndex {
    /// Serialize the index
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writes into a Vec cannot fail.
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u32::<BigEndian>(self.flags.bits())?;
        write_short_str_u8(buf, &self.codec_id)?;
        buf.write_u64::<BigEndian>(self.total_pages)?;
        buf.write_u32::<BigEndian>(self.blocks.len() as u32)?;
        for block in &self.blocks {
            write_short_str_u16(buf, &block.id)?;
            buf.write_u64::<BigEndian>(block.page_count)?;
            buf.write_u32::<BigEndian>(block.page_size)?;
            buf.write_u32::<BigEndian>(block.flags.bits())?;
            write_short_str_u16(buf, &block.path)?;
            buf.write_u8(block.pages_stored as u8)?;
            if block.pages_stored {
                for page in &block.pages {
                    write_varint(buf, u64::from(page.size_on_disk));
                    if !page.is_zero() {
                        buf.write_u64::<BigEndian>(page.file_pos)?;
                        buf.write_u64::<BigEndian>(page.hash)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Parse an index, checking it against the CRC from the header
    pub fn decode(bytes: &[u8], expected_crc: u32) -> Result<Self, RamFormatError> {
        let actual = crc32fast::hash(bytes);
        if actual != expected_crc {
            return Err(RamFormatError::CrcMismatch {
                expected: expected_crc,
                actual,
            });
        }
        let mut rdr = bytes;
        Self::read_from(&mut rdr).map_err(|e| match e {
            RamFormatError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                RamFormatError::Truncated("index ended early".to_string())
            }
            other => other,
        })
    }

    fn read_from(rdr: &mut &[u8]) -> Result<Self, RamFormatError> {
        let flags = IndexFlags::from_bits_truncate(rdr.read_u32::<BigEndian>()?);
        let codec_len = rdr.read_u8()? as usize;
        let codec_id = read_string(rdr, codec_len)?;
        let total_pages = rdr.read_u64::<BigEndian>()?;
        let block_count = rdr.read_u32::<BigEndian>()?;
        let mut blocks = Vec::with_capacity(block_count.min(1024) as usize);
        for _ in 0..block_count {
            let id_len = rdr.read_u16::<BigEndian>()? as usize;
            let id = read_string(rdr, id_len)?;
            let page_count = rdr.read_u64::<BigEndian>()?;
            let page_size = rdr.read_u32::<BigEndian>()?;
            let flags = RamBlockFlags::from_bits_truncate(rdr.read_u32::<BigEndian>()?);
            let path_len = rdr.read_u16::<BigEndian>()? as usize;
            let path = read_string(rdr, path_len)?;
            let pages_stored = rdr.read_u8()? != 0;
            let mut pages = Vec::new();
            if pages_stored {
                // Every page needs at least one byte, so a bogus count
                // cannot make us allocate more than the input size.
                if page_count > rdr.len() as u64 {
                    return Err(RamFormatError::Truncated(format!(
                        "block {id} claims {page_count} pages"
                    )));
                }
                pages.reserve(page_count as usize);
                for _ in 0..page_count {
                    let size = read_varint(rdr)?;
                    let size_on_disk = u32::try_from(size).map_err(|_| {
                        RamFormatError::Truncated(format!("page size {size} out of range"))
                    })?;
                    if size_on_disk == 0 {
                        pages.push(PageEntry::ZERO);
                    } else {
                        pages.push(PageEntry {
                            size_on_disk,
                            file_pos: rdr.read_u64::<BigEndian>()?,
                            hash: rdr.read_u64::<BigEndian>()?,
                        });
                    }
                }
            }
            blocks.push(IndexBlock {
                id,
                page_count,
                page_size,
                flags,
                path,
                pages,
                pages_stored,
            });
        }
        Ok(FileIndex {
            flags,
            codec_id,
            total_pages,
            blocks,
        })
    }
}

fn write_short_str_u8(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
    buf.write_u8(bytes.len() as u8)?;
    buf.write_all(bytes)
}

fn write_short_str_u16(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.write_u16::<BigEndian>(bytes.len() as u16)?;
    buf.write_all(bytes)
}

fn read_string(rdr: &mut &[u8], len: usize) -> Result<String, RamFormatError> {
    if rdr.len() < len {
        return Err(RamFormatError::Truncated("string ended early".to_string()));
    }
    let (head, rest) = rdr.split_at(len);
    *rdr = rest;
    String::from_utf8(head.to_vec())
        .map_err(|_| RamFormatError::Truncated("string is not UTF-8".to_string()))
}

/// Append an unsigned LEB128 varint
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint
pub fn read_varint(rdr: &mut &[u8]) -> Result<u64, RamFormatError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = rdr.read_u8()?;
        if shift >= 64 {
            return Err(RamFormatError::Truncated("varint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
