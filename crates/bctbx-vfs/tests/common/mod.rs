//! Helpers shared by the bctbx-vfs integration tests.
//!
//! The open policy picks the suite from the file name, so a test selects the
//! suite just by naming its file `<stem>.<suite>.evfs`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use bctbx_core::{EncryptionSuite, EvfsError, EvfsResult, OpenFlags};
use bctbx_vfs::{EncryptedVfs, EncryptionSettings, Vfs, VfsFile};
use tempfile::TempDir;

pub const DUMMY_KEY: [u8; 16] = [0xFF; 16];

pub const AES_KEY: [u8; 32] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0xf0,
    0x11, 0x12, 0x13, 0x54, 0x55, 0x56, 0xa7, 0xa8, 0xa9, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0xef,
];

pub const CHUNK_SIZE: u32 = 16;

pub const ENCRYPTING: [EncryptionSuite; 2] =
    [EncryptionSuite::Dummy, EncryptionSuite::Aes256Gcm128Sha256];

/// 256 bytes: 0x42 then 0x01..=0xff
pub fn message() -> Vec<u8> {
    let mut msg: Vec<u8> = (0..=255u8).collect();
    msg[0] = 0x42;
    msg
}

pub fn suite_from_name(settings: &mut EncryptionSettings) -> EvfsResult<()> {
    let name = settings.file_name();
    if name.contains(EncryptionSuite::Plain.name()) {
        settings.set_suite(EncryptionSuite::Plain)
    } else if name.contains(EncryptionSuite::Aes256Gcm128Sha256.name()) {
        settings.set_suite(EncryptionSuite::Aes256Gcm128Sha256)?;
        settings.set_chunk_size(CHUNK_SIZE)?;
        settings.set_secret_material(&AES_KEY)
    } else if name.contains(EncryptionSuite::Dummy.name()) {
        settings.set_suite(EncryptionSuite::Dummy)?;
        settings.set_chunk_size(CHUNK_SIZE)?;
        settings.set_secret_material(&DUMMY_KEY)
    } else {
        Err(EvfsError::ConfigConflict(format!("no test suite for {name}")))
    }
}

pub fn suite_path(dir: &TempDir, stem: &str, suite: EncryptionSuite) -> PathBuf {
    dir.path().join(format!("{stem}.{}.evfs", suite.name()))
}

pub fn try_open(path: &Path, flags: OpenFlags) -> EvfsResult<VfsFile> {
    let vfs = EncryptedVfs::new(suite_from_name);
    Ok(VfsFile::new(vfs.open(path, flags)?))
}

pub fn open(path: &Path, flags: OpenFlags) -> VfsFile {
    try_open(path, flags).expect("open through encrypted vfs")
}

/// Size of the header that precedes the first chunk.
pub fn header_size(suite: EncryptionSuite) -> usize {
    match suite {
        EncryptionSuite::Dummy => 29 + 16,
        EncryptionSuite::Aes256Gcm128Sha256 => 29 + 48,
        _ => 0,
    }
}

/// Bytes each chunk carries in front of its payload.
pub fn chunk_header_size(suite: EncryptionSuite) -> usize {
    match suite {
        EncryptionSuite::Dummy => 16,
        EncryptionSuite::Aes256Gcm128Sha256 => 28,
        _ => 0,
    }
}
