//! The self-describing header at the start of every encrypted file
//!
//! Base header (29 bytes, big-endian):
//! ```text
//! offset 0   len 13   magic "bcEncryptedFs"
//! offset 13  len 2    version (0x0100)
//! offset 15  len 2    encryption suite id
//! offset 17  len 2    chunk size in 16-byte blocks
//! offset 19  len 2    header extension size (0 in version 1.0)
//! offset 21  len 8    plaintext file size
//! ```
//! The header extension (skipped) and the module trailer follow.

use bctbx_core::{EncryptionSuite, EvfsError, EvfsResult};
use tracing::warn;

pub const MAGIC: &[u8; 13] = b"bcEncryptedFs";
pub const VERSION_1_0: u16 = 0x0100;
pub const BASE_HEADER_SIZE: usize = 29;

pub const MIN_CHUNK_SIZE: u32 = 16;
pub const MAX_CHUNK_SIZE: u32 = 0xFFFF * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub suite: EncryptionSuite,
    /// Plaintext bytes per chunk
    pub chunk_size: u32,
    pub extension_size: u16,
    /// Plaintext file size
    pub file_size: u64,
}

/// Reject chunk sizes the header cannot express.
pub fn validate_chunk_size(size: u32) -> EvfsResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        return Err(EvfsError::InvalidArgument(format!(
            "chunk size {size} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"
        )));
    }
    if size % 16 != 0 {
        return Err(EvfsError::InvalidArgument(format!(
            "chunk size {size} is not a multiple of 16"
        )));
    }
    Ok(())
}

impl FileHeader {
    /// Header for a new, empty file.
    pub fn new(suite: EncryptionSuite, chunk_size: u32) -> EvfsResult<Self> {
        validate_chunk_size(chunk_size)?;
        if !suite.is_encrypting() {
            return Err(EvfsError::UnsupportedSuite(suite.id()));
        }
        Ok(Self {
            version: VERSION_1_0,
            suite,
            chunk_size,
            extension_size: 0,
            file_size: 0,
        })
    }

    pub fn encode(&self) -> [u8; BASE_HEADER_SIZE] {
        let mut buf = [0u8; BASE_HEADER_SIZE];
        buf[..13].copy_from_slice(MAGIC);
        buf[13..15].copy_from_slice(&self.version.to_be_bytes());
        buf[15..17].copy_from_slice(&self.suite.id().to_be_bytes());
        // chunk_size is validated on every construction path
        buf[17..19].copy_from_slice(&((self.chunk_size / 16) as u16).to_be_bytes());
        buf[19..21].copy_from_slice(&self.extension_size.to_be_bytes());
        buf[21..29].copy_from_slice(&self.file_size.to_be_bytes());
        buf
    }

    /// Parse the base header. `Ok(None)` means the bytes are not an encrypted
    /// file at all (too short or wrong magic), i.e. a plaintext file.
    pub fn decode(raw: &[u8]) -> EvfsResult<Option<Self>> {
        if raw.len() < BASE_HEADER_SIZE || &raw[..13] != MAGIC {
            return Ok(None);
        }
        let be16 = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);

        let version = be16(13);
        if version != VERSION_1_0 {
            warn!(
                version,
                supported = VERSION_1_0,
                "encrypted file version differs from the supported one, proceeding anyway"
            );
        }

        let suite_id = be16(15);
        let suite = EncryptionSuite::from_id(suite_id)?;
        if !suite.is_encrypting() {
            return Err(EvfsError::UnsupportedSuite(suite_id));
        }

        let blocks = be16(17);
        if blocks == 0 {
            return Err(EvfsError::Format("header declares a zero chunk size".into()));
        }

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&raw[21..29]);

        Ok(Some(Self {
            version,
            suite,
            chunk_size: u32::from(blocks) * 16,
            extension_size: be16(19),
            file_size: u64::from_be_bytes(size_bytes),
        }))
    }

    /// Offset of the module trailer.
    pub fn module_header_offset(&self) -> u64 {
        BASE_HEADER_SIZE as u64 + u64::from(self.extension_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut header = FileHeader::new(EncryptionSuite::Dummy, 16).unwrap();
        header.file_size = 0x0102;
        let raw = header.encode();

        assert_eq!(&raw[..13], b"bcEncryptedFs");
        assert_eq!(
            &raw[..13],
            &[0x62, 0x63, 0x45, 0x6e, 0x63, 0x72, 0x79, 0x70, 0x74, 0x65, 0x64, 0x46, 0x73]
        );
        assert_eq!(&raw[13..15], &[0x01, 0x00]);
        assert_eq!(&raw[15..17], &[0x00, 0x01]);
        assert_eq!(&raw[17..19], &[0x00, 0x01]);
        assert_eq!(&raw[19..21], &[0x00, 0x00]);
        assert_eq!(&raw[21..29], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_encoded() {
        let mut header = FileHeader::new(EncryptionSuite::Aes256Gcm128Sha256, 4096).unwrap();
        header.file_size = 1 << 40;

        let decoded = FileHeader::decode(&header.encode()).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.module_header_offset(), 29);
    }

    #[test]
    fn test_same_size_encodes_identically() {
        let mut header = FileHeader::new(EncryptionSuite::Aes256Gcm128Sha256, 64).unwrap();
        header.file_size = 142;
        let first = header.encode();

        let mut reread = FileHeader::decode(&first).unwrap().unwrap();
        reread.file_size = 142;
        assert_eq!(reread.encode(), first);
    }

    #[test]
    fn test_plaintext_is_not_a_header() {
        assert_eq!(FileHeader::decode(b"hello world").unwrap(), None);
        assert_eq!(FileHeader::decode(&[0x62u8; 64]).unwrap(), None);
    }

    #[test]
    fn test_unknown_suite_is_rejected() {
        let mut raw = FileHeader::new(EncryptionSuite::Dummy, 16).unwrap().encode();
        raw[15..17].copy_from_slice(&0x0077u16.to_be_bytes());
        assert!(matches!(
            FileHeader::decode(&raw),
            Err(EvfsError::UnsupportedSuite(0x0077))
        ));

        raw[15..17].copy_from_slice(&0xFFFFu16.to_be_bytes());
        assert!(matches!(
            FileHeader::decode(&raw),
            Err(EvfsError::UnsupportedSuite(0xFFFF))
        ));
    }

    #[test]
    fn test_future_version_still_parses() {
        let mut raw = FileHeader::new(EncryptionSuite::Dummy, 32).unwrap().encode();
        raw[13..15].copy_from_slice(&0x0200u16.to_be_bytes());
        raw[19..21].copy_from_slice(&8u16.to_be_bytes());

        let header = FileHeader::decode(&raw).unwrap().unwrap();
        assert_eq!(header.version, 0x0200);
        assert_eq!(header.chunk_size, 32);
        assert_eq!(header.module_header_offset(), 37);
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(validate_chunk_size(16).is_ok());
        assert!(validate_chunk_size(1_048_560).is_ok());
        assert!(validate_chunk_size(0).is_err());
        assert!(validate_chunk_size(8).is_err());
        assert!(validate_chunk_size(1_048_576).is_err());
        assert!(validate_chunk_size(4100).is_err());
    }
}
