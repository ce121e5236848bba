//! The encryption module interface and the suite factory

use bctbx_core::{EncryptionSuite, EvfsError, EvfsResult};

use crate::aes256gcm_sha256::{self, Aes256GcmSha256};
use crate::dummy::{self, DummyModule};

/// A cipher suite bound to one open file.
///
/// A module instance is created when a file is opened (from the module file
/// header on disk, or fresh for a new file), receives its secret material once,
/// and is dropped with the file handle. Implementations zeroize their keys on
/// drop.
pub trait EncryptionModule: Send {
    fn suite(&self) -> EncryptionSuite;

    /// Bytes this module stores after the 29-byte base header.
    fn module_file_header_size(&self) -> usize;

    /// Bytes prepended to every chunk payload on disk.
    fn chunk_header_size(&self) -> usize;

    /// Exact length `set_secret_material` accepts.
    fn secret_material_size(&self) -> usize;

    /// Install the file secret. Fails with `KeySize` on a length mismatch.
    fn set_secret_material(&mut self, secret: &[u8]) -> EvfsResult<()>;

    fn has_secret_material(&self) -> bool;

    /// Build the module trailer written after `base_header`.
    fn module_file_header(&mut self, base_header: &[u8]) -> EvfsResult<Vec<u8>>;

    /// Verify the stored header tag against `base_header`.
    fn check_integrity(&self, base_header: &[u8]) -> EvfsResult<bool>;

    /// Encrypt a chunk that has no previous version on disk.
    fn encrypt_chunk(&self, index: u32, plain: &[u8]) -> EvfsResult<Vec<u8>>;

    /// Encrypt new content for a chunk whose current raw form is `existing`.
    fn reencrypt_chunk(&self, index: u32, existing: &[u8], plain: &[u8]) -> EvfsResult<Vec<u8>> {
        let _ = existing;
        self.encrypt_chunk(index, plain)
    }

    /// Authenticate and decrypt a raw chunk. Fails with `AuthFailure`.
    fn decrypt_chunk(&self, index: u32, raw: &[u8]) -> EvfsResult<Vec<u8>>;
}

/// Module trailer size for a suite, known before any module is built.
pub fn module_file_header_size(suite: EncryptionSuite) -> EvfsResult<usize> {
    match suite {
        EncryptionSuite::Dummy => Ok(dummy::MODULE_FILE_HEADER_SIZE),
        EncryptionSuite::Aes256Gcm128Sha256 => Ok(aes256gcm_sha256::MODULE_FILE_HEADER_SIZE),
        other => Err(EvfsError::UnsupportedSuite(other.id())),
    }
}

/// Per-chunk header size for a suite.
pub fn chunk_header_size(suite: EncryptionSuite) -> EvfsResult<usize> {
    match suite {
        EncryptionSuite::Dummy => Ok(dummy::CHUNK_HEADER_SIZE),
        EncryptionSuite::Aes256Gcm128Sha256 => Ok(aes256gcm_sha256::CHUNK_HEADER_SIZE),
        other => Err(EvfsError::UnsupportedSuite(other.id())),
    }
}

/// Secret length a suite expects, known before any module is built.
pub fn secret_material_size(suite: EncryptionSuite) -> EvfsResult<usize> {
    match suite {
        EncryptionSuite::Dummy => Ok(dummy::SECRET_MATERIAL_SIZE),
        EncryptionSuite::Aes256Gcm128Sha256 => Ok(crate::KEY_SIZE),
        other => Err(EvfsError::UnsupportedSuite(other.id())),
    }
}

/// Build a module for a file being created.
pub fn new_module(suite: EncryptionSuite) -> EvfsResult<Box<dyn EncryptionModule>> {
    match suite {
        EncryptionSuite::Dummy => Ok(Box::new(DummyModule::new())),
        EncryptionSuite::Aes256Gcm128Sha256 => Ok(Box::new(Aes256GcmSha256::new())),
        other => Err(EvfsError::UnsupportedSuite(other.id())),
    }
}

/// Build a module from the trailer of an existing file header.
pub fn open_module(
    suite: EncryptionSuite,
    module_header: &[u8],
) -> EvfsResult<Box<dyn EncryptionModule>> {
    match suite {
        EncryptionSuite::Dummy => Ok(Box::new(DummyModule::from_module_header(module_header)?)),
        EncryptionSuite::Aes256Gcm128Sha256 => Ok(Box::new(
            Aes256GcmSha256::from_module_header(module_header)?,
        )),
        other => Err(EvfsError::UnsupportedSuite(other.id())),
    }
}
