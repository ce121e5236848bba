//! Chunk addressing: mapping plaintext offsets to raw file offsets
//!
//! Raw file layout:
//! ```text
//! [base header 29][extension][module header][chunk 0 header][chunk 0 payload][chunk 1 header]...
//! ```
//! Every chunk payload is `chunk_size` bytes except possibly the last one.

use bctbx_core::{EvfsError, EvfsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: u64,
    chunk_header_size: u64,
    header_size: u64,
}

/// What a raw file size says about the chunks stored after the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTail {
    /// Chunks carrying a full `chunk_size` payload
    pub full_chunks: u64,
    /// Payload length of a trailing short chunk, if any
    pub partial_payload: Option<u64>,
    /// Trailing bytes too short to hold a chunk header plus one payload byte
    pub torn_bytes: u64,
}

impl ChunkLayout {
    /// `header_size` is the full on-disk header: base, extension and module trailer.
    pub fn new(chunk_size: u32, chunk_header_size: usize, header_size: u64) -> Self {
        Self {
            chunk_size: u64::from(chunk_size),
            chunk_header_size: chunk_header_size as u64,
            header_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_header_size(&self) -> u64 {
        self.chunk_header_size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn raw_chunk_size(&self) -> u64 {
        self.chunk_size + self.chunk_header_size
    }

    pub fn chunk_index(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    pub fn chunk_raw_offset(&self, index: u64) -> u64 {
        self.header_size + index * self.raw_chunk_size()
    }

    pub fn chunk_count(&self, plain_size: u64) -> u64 {
        plain_size.div_ceil(self.chunk_size)
    }

    pub fn raw_file_size(&self, plain_size: u64) -> u64 {
        self.header_size + self.chunk_count(plain_size) * self.chunk_header_size + plain_size
    }

    /// Split a raw file size into full chunks and a trailing remainder.
    ///
    /// Returns `None` when the raw size cannot even hold the header.
    pub fn raw_tail(&self, raw_size: u64) -> Option<RawTail> {
        let data = raw_size.checked_sub(self.header_size)?;
        let full_chunks = data / self.raw_chunk_size();
        let rem = data % self.raw_chunk_size();
        let tail = if rem > self.chunk_header_size {
            RawTail {
                full_chunks,
                partial_payload: Some(rem - self.chunk_header_size),
                torn_bytes: 0,
            }
        } else {
            RawTail {
                full_chunks,
                partial_payload: None,
                torn_bytes: rem,
            }
        };
        Some(tail)
    }
}

/// Encryption modules bind chunks to a 32-bit index.
pub fn module_index(index: u64) -> EvfsResult<u32> {
    u32::try_from(index).map_err(|_| {
        EvfsError::InvalidArgument(format!(
            "chunk index {index} exceeds the 2^32 chunk limit of an encrypted file"
        ))
    })
}
