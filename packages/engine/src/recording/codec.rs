// packages/engine/src/recording/codec.rs
//! Binary layouts of the event store
//!
//! All integers are little-endian.
//!
//! ```text
//! file     : magic(0xD1 0xD1) | version(1) | windowStartUnix(u32) | block...
//! block    : compressedSize(u32) | uncompressedSize(u32) | entryCount(u16)
//!            | minCTS(u32) | maxCTS(u32) | lz4(entry...)
//! entry    : size(u32) | cts(u32) | body[size]
//! block id : fileName[12] | indexWithinFile(u32)
//! listing  : (block id | block)...
//! ```
//!
//! Decoding never truncates silently: a buffer shorter than a declared size
//! yields [`EngineError::TruncatedBuffer`].

use crate::recording::compressor;
use crate::recording::window::FILE_NAME_LEN;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;

pub const FILE_HEADER_SIZE: usize = 7;
pub const BLOCK_HEADER_SIZE: usize = 18;
pub const BLOCK_ID_SIZE: usize = FILE_NAME_LEN + 4;
pub const ENTRY_HEADER_SIZE: usize = 8;

pub const FILE_MAGIC: [u8; 2] = [0xD1, 0xD1];
pub const FILE_VERSION: u8 = 1;

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(EngineError::TruncatedBuffer {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Header written once when a window file is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub window_start_unix: u32,
}

impl FileHeader {
    pub fn new(window_start_unix: u32) -> Self {
        Self { window_start_unix }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..2].copy_from_slice(&FILE_MAGIC);
        buf[2] = FILE_VERSION;
        buf[3..7].copy_from_slice(&self.window_start_unix.to_le_bytes());
        buf
    }

    /// Decode and validate magic and version; the error is a human readable reason
    pub fn decode(buf: &[u8; FILE_HEADER_SIZE]) -> std::result::Result<Self, String> {
        if buf[0..2] != FILE_MAGIC {
            return Err(format!("bad magic {:02x}{:02x}", buf[0], buf[1]));
        }
        if buf[2] != FILE_VERSION {
            return Err(format!("unsupported version {}", buf[2]));
        }
        Ok(Self {
            window_start_unix: le_u32(&buf[3..7]),
        })
    }
}

/// Fixed-size header preceding each compressed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub entries_count: u16,
    pub min_cts: u32,
    pub max_cts: u32,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        buf[8..10].copy_from_slice(&self.entries_count.to_le_bytes());
        buf[10..14].copy_from_slice(&self.min_cts.to_le_bytes());
        buf[14..18].copy_from_slice(&self.max_cts.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure(buf, BLOCK_HEADER_SIZE)?;
        Ok(Self {
            compressed_size: le_u32(&buf[0..4]),
            uncompressed_size: le_u32(&buf[4..8]),
            entries_count: le_u16(&buf[8..10]),
            min_cts: le_u32(&buf[10..14]),
            max_cts: le_u32(&buf[14..18]),
        })
    }
}

/// Append one `size | cts | body` entry to a block body
pub fn append_entry(out: &mut Vec<u8>, cts: u32, body: &[u8]) {
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&cts.to_le_bytes());
    out.extend_from_slice(body);
}

/// One decoded entry, borrowing the decompressed block body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEntry<'a> {
    pub cts: u32,
    pub body: &'a [u8],
}

/// Cursor over back-to-back entries of a decompressed block
#[derive(Debug, Clone, Copy)]
pub struct EventEntries<'a> {
    buf: &'a [u8],
}

impl<'a> EventEntries<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume one entry, returning it and the remainder
    pub fn next(self) -> Result<(EventEntry<'a>, EventEntries<'a>)> {
        ensure(self.buf, ENTRY_HEADER_SIZE)?;
        let size = le_u32(&self.buf[0..4]) as usize;
        let cts = le_u32(&self.buf[4..8]);
        let end = ENTRY_HEADER_SIZE + size;
        ensure(self.buf, end)?;
        let entry = EventEntry {
            cts,
            body: &self.buf[ENTRY_HEADER_SIZE..end],
        };
        Ok((entry, EventEntries::new(&self.buf[end..])))
    }
}

impl<'a> Iterator for EventEntries<'a> {
    type Item = Result<EventEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        match EventEntries::next(*self) {
            Ok((entry, rest)) => {
                *self = rest;
                Some(Ok(entry))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

/// Address of a block within one listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBlockId {
    pub file_name: String,
    pub index: u32,
}

impl EventBlockId {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let name = self.file_name.as_bytes();
        let mut fixed = [b'0'; FILE_NAME_LEN];
        let len = name.len().min(FILE_NAME_LEN);
        fixed[..len].copy_from_slice(&name[..len]);
        out.extend_from_slice(&fixed);
        out.extend_from_slice(&self.index.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure(buf, BLOCK_ID_SIZE)?;
        Ok(Self {
            file_name: String::from_utf8_lossy(&buf[..FILE_NAME_LEN]).into_owned(),
            index: le_u32(&buf[FILE_NAME_LEN..BLOCK_ID_SIZE]),
        })
    }
}

/// A block header plus its still-compressed payload
#[derive(Debug, Clone, Copy)]
pub struct EventBlock<'a> {
    pub header: BlockHeader,
    pub payload: &'a [u8],
}

impl<'a> EventBlock<'a> {
    /// Decompress the payload into the concatenated entries
    pub fn decompress(&self) -> Result<Vec<u8>> {
        compressor::decompress(self.payload, self.header.uncompressed_size as usize)
    }

    /// Decompress and decode all entries into owned `(cts, body)` pairs
    pub fn entries(&self) -> Result<Vec<(u32, Bytes)>> {
        let body = Bytes::from(self.decompress()?);
        let mut entries = Vec::with_capacity(self.header.entries_count as usize);
        for entry in EventEntries::new(&body) {
            let entry = entry?;
            entries.push((entry.cts, body.slice_ref(entry.body)));
        }
        if entries.len() != self.header.entries_count as usize {
            return Err(EngineError::Compression(format!(
                "block declares {} entries, decoded {}",
                self.header.entries_count,
                entries.len()
            )));
        }
        Ok(entries)
    }
}

/// Cursor over `block id | block` records of a listing
#[derive(Debug, Clone, Copy)]
pub struct BlockCursor<'a> {
    buf: &'a [u8],
}

impl<'a> BlockCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume one block without decompressing it
    pub fn next(self) -> Result<(EventBlockId, EventBlock<'a>, BlockCursor<'a>)> {
        let id = EventBlockId::decode(self.buf)?;
        let header = BlockHeader::decode(&self.buf[BLOCK_ID_SIZE..])?;
        let start = BLOCK_ID_SIZE + BLOCK_HEADER_SIZE;
        let end = start + header.compressed_size as usize;
        ensure(self.buf, end)?;
        let block = EventBlock {
            header,
            payload: &self.buf[start..end],
        };
        Ok((id, block, BlockCursor::new(&self.buf[end..])))
    }
}

impl<'a> Iterator for BlockCursor<'a> {
    type Item = Result<(EventBlockId, EventBlock<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        match BlockCursor::next(*self) {
            Ok((id, block, rest)) => {
                *self = rest;
                Some(Ok((id, block)))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

/// Owned result of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBlocks {
    buf: Bytes,
}

impl EventBlocks {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    pub fn cursor(&self) -> BlockCursor<'_> {
        BlockCursor::new(&self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::compressor::Lz4Compressor;
    use proptest::prelude::*;

    fn listing_of(bodies: &[&[u8]]) -> Vec<u8> {
        let mut raw = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            append_entry(&mut raw, i as u32, body);
        }
        let mut compressor = Lz4Compressor::new();
        let payload = compressor.compress(&raw).unwrap().to_vec();
        let header = BlockHeader {
            compressed_size: payload.len() as u32,
            uncompressed_size: raw.len() as u32,
            entries_count: bodies.len() as u16,
            min_cts: 0,
            max_cts: bodies.len().saturating_sub(1) as u32,
        };

        let mut out = Vec::new();
        EventBlockId {
            file_name: "201701010800".to_string(),
            index: 0,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn test_file_header_layout() {
        let header = FileHeader::new(1_483_228_800);
        let bytes = header.encode();
        assert_eq!(&bytes[..3], &[0xD1, 0xD1, 1]);
        assert_eq!(&bytes[3..], &1_483_228_800u32.to_le_bytes());
        assert_eq!(FileHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_file_header_rejects_bad_magic() {
        let mut bytes = FileHeader::new(0).encode();
        bytes[0] = 0;
        assert!(FileHeader::decode(&bytes).is_err());

        let mut bytes = FileHeader::new(0).encode();
        bytes[2] = 2;
        assert!(FileHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_block_header_offsets() {
        let header = BlockHeader {
            compressed_size: 1,
            uncompressed_size: 2,
            entries_count: 3,
            min_cts: 4,
            max_cts: 5,
        };
        let bytes = header.encode();
        assert_eq!(bytes[8], 3);
        assert_eq!(bytes[10], 4);
        assert_eq!(bytes[14], 5);
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_entries_next() {
        let mut raw = Vec::new();
        append_entry(&mut raw, 7, b"hello");
        append_entry(&mut raw, 9, b"");

        let (first, rest) = EventEntries::new(&raw).next().unwrap();
        assert_eq!(first, EventEntry { cts: 7, body: b"hello" });
        let (second, rest) = rest.next().unwrap();
        assert_eq!(second.cts, 9);
        assert!(second.body.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_entries_truncated_header() {
        let err = EventEntries::new(&[1, 0, 0]).next().unwrap_err();
        assert!(matches!(
            err,
            EngineError::TruncatedBuffer {
                needed: 8,
                available: 3
            }
        ));
    }

    #[test]
    fn test_entries_declared_size_exceeds_buffer() {
        let mut raw = Vec::new();
        append_entry(&mut raw, 0, b"hello");
        raw.truncate(raw.len() - 1);

        let results: Vec<_> = EventEntries::new(&raw).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(EngineError::TruncatedBuffer { .. })));
    }

    #[test]
    fn test_block_cursor() {
        let mut buf = listing_of(&[b"a", b"bb"]);
        buf.extend_from_slice(&listing_of(&[b"ccc"]));
        let blocks = EventBlocks::new(buf);

        let (id, block, rest) = blocks.cursor().next().unwrap();
        assert_eq!(id.file_name, "201701010800");
        assert_eq!(block.header.entries_count, 2);
        let entries = block.entries().unwrap();
        assert_eq!(&entries[1].1[..], b"bb");

        let (_, block, rest) = rest.next().unwrap();
        assert_eq!(&block.entries().unwrap()[0].1[..], b"ccc");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_block_cursor_truncated_payload() {
        let mut buf = listing_of(&[b"hello world"]);
        buf.pop();
        let blocks = EventBlocks::new(buf);
        assert!(matches!(
            blocks.cursor().next(),
            Err(EngineError::TruncatedBuffer { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_every_prefix_either_decodes_or_fails_loudly(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
            cut in 0usize..512,
        ) {
            let mut raw = Vec::new();
            for body in &bodies {
                append_entry(&mut raw, 0, body);
            }
            let cut = cut.min(raw.len());
            let decoded: Vec<_> = EventEntries::new(&raw[..cut]).collect();
            let ok = decoded.iter().filter(|r| r.is_ok()).count();
            let failed = decoded.iter().filter(|r| r.is_err()).count();

            prop_assert!(ok <= bodies.len());
            prop_assert!(failed <= 1);
            if cut == raw.len() {
                prop_assert_eq!(ok, bodies.len());
                prop_assert_eq!(failed, 0);
            }
        }
    }
}
