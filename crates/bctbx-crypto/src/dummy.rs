//! Dummy suite: XOR "encryption" with truncated HMAC tags, for tests only
//!
//! This suite gives no confidentiality. It exists to exercise the VFS with
//! predictable raw bytes and a visible per-chunk re-encryption counter.
//!
//! Module file header (16 bytes):
//! ```text
//! [8 bytes: HMAC-SHA256(secret, base_header || global_iv)[..8]][8 bytes: global_iv]
//! ```
//!
//! Raw chunk:
//! ```text
//! [8 bytes: HMAC-SHA256(secret, chunk[8..])[..8]][4 bytes: index BE][4 bytes: encryption count BE][payload XOR key]
//! key = (global_iv || chunk[8..16]) XOR secret, repeated every 16 bytes
//! ```

use bctbx_core::{EncryptionSuite, EvfsError, EvfsResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::module::EncryptionModule;

type HmacSha256 = Hmac<Sha256>;

pub const MODULE_FILE_HEADER_SIZE: usize = 16;
pub const CHUNK_HEADER_SIZE: usize = 16;
pub const SECRET_MATERIAL_SIZE: usize = 16;

const INTEGRITY_SIZE: usize = 8;
const GLOBAL_IV: [u8; 8] = [0xaa, 0x55, 0xbb, 0x44, 0xcc, 0x33, 0xdd, 0x22];

pub struct DummyModule {
    global_iv: [u8; 8],
    header_integrity: [u8; INTEGRITY_SIZE],
    secret: Option<Zeroizing<[u8; SECRET_MATERIAL_SIZE]>>,
}

impl DummyModule {
    pub fn new() -> Self {
        Self {
            global_iv: GLOBAL_IV,
            header_integrity: [0u8; INTEGRITY_SIZE],
            secret: None,
        }
    }

    pub fn from_module_header(module_header: &[u8]) -> EvfsResult<Self> {
        if module_header.len() != MODULE_FILE_HEADER_SIZE {
            return Err(EvfsError::Format(format!(
                "dummy module header is {} bytes (expected {MODULE_FILE_HEADER_SIZE})",
                module_header.len()
            )));
        }
        let mut header_integrity = [0u8; INTEGRITY_SIZE];
        header_integrity.copy_from_slice(&module_header[..INTEGRITY_SIZE]);
        let mut global_iv = [0u8; 8];
        global_iv.copy_from_slice(&module_header[INTEGRITY_SIZE..]);
        Ok(Self {
            global_iv,
            header_integrity,
            secret: None,
        })
    }

    fn mac(&self) -> EvfsResult<HmacSha256> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            EvfsError::InvalidArgument("dummy module used before its secret material was set".into())
        })?;
        <HmacSha256 as Mac>::new_from_slice(&secret[..])
            .map_err(|e| EvfsError::InvalidArgument(format!("HMAC key rejected: {e}")))
    }

    fn header_mac(&self, base_header: &[u8]) -> EvfsResult<HmacSha256> {
        let mut mac = self.mac()?;
        mac.update(base_header);
        mac.update(&self.global_iv);
        Ok(mac)
    }

    fn chunk_mac(&self, raw: &[u8]) -> EvfsResult<HmacSha256> {
        let mut mac = self.mac()?;
        mac.update(&raw[INTEGRITY_SIZE..]);
        Ok(mac)
    }

    fn seal(&self, raw: &mut [u8]) -> EvfsResult<()> {
        let tag = self.chunk_mac(raw)?.finalize().into_bytes();
        raw[..INTEGRITY_SIZE].copy_from_slice(&tag[..INTEGRITY_SIZE]);
        Ok(())
    }

    fn verify(&self, index: u32, raw: &[u8]) -> EvfsResult<()> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(EvfsError::AuthFailure(format!(
                "chunk {index} too short: {} bytes (minimum {CHUNK_HEADER_SIZE})",
                raw.len()
            )));
        }
        self.chunk_mac(raw)?
            .verify_truncated_left(&raw[..INTEGRITY_SIZE])
            .map_err(|_| EvfsError::AuthFailure(format!("chunk {index} failed integrity check")))?;
        let stored = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if stored != index {
            return Err(EvfsError::AuthFailure(format!(
                "chunk {index} carries index {stored}"
            )));
        }
        Ok(())
    }

    /// XOR `data` in place with the key derived from the chunk header.
    fn apply_keystream(&self, chunk_header: &[u8], data: &mut [u8]) -> EvfsResult<()> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            EvfsError::InvalidArgument("dummy module used before its secret material was set".into())
        })?;
        let mut key = Zeroizing::new([0u8; 16]);
        key[..8].copy_from_slice(&self.global_iv);
        key[8..].copy_from_slice(&chunk_header[8..CHUNK_HEADER_SIZE]);
        for (k, s) in key.iter_mut().zip(secret.iter()) {
            *k ^= s;
        }
        for block in data.chunks_mut(16) {
            for (byte, k) in block.iter_mut().zip(key.iter()) {
                *byte ^= k;
            }
        }
        Ok(())
    }

    fn build(&self, header: [u8; CHUNK_HEADER_SIZE], plain: &[u8]) -> EvfsResult<Vec<u8>> {
        let mut raw = Vec::with_capacity(CHUNK_HEADER_SIZE + plain.len());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(plain);
        let (head, payload) = raw.split_at_mut(CHUNK_HEADER_SIZE);
        self.apply_keystream(head, payload)?;
        self.seal(&mut raw)?;
        Ok(raw)
    }
}

impl Default for DummyModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DummyModule {
    fn drop(&mut self) {
        self.header_integrity.zeroize();
    }
}

impl EncryptionModule for DummyModule {
    fn suite(&self) -> EncryptionSuite {
        EncryptionSuite::Dummy
    }

    fn module_file_header_size(&self) -> usize {
        MODULE_FILE_HEADER_SIZE
    }

    fn chunk_header_size(&self) -> usize {
        CHUNK_HEADER_SIZE
    }

    fn secret_material_size(&self) -> usize {
        SECRET_MATERIAL_SIZE
    }

    fn set_secret_material(&mut self, secret: &[u8]) -> EvfsResult<()> {
        if secret.len() != SECRET_MATERIAL_SIZE {
            return Err(EvfsError::KeySize {
                expected: SECRET_MATERIAL_SIZE,
                actual: secret.len(),
            });
        }
        let mut bytes = Zeroizing::new([0u8; SECRET_MATERIAL_SIZE]);
        bytes.copy_from_slice(secret);
        self.secret = Some(bytes);
        Ok(())
    }

    fn has_secret_material(&self) -> bool {
        self.secret.is_some()
    }

    fn module_file_header(&mut self, base_header: &[u8]) -> EvfsResult<Vec<u8>> {
        let tag = self.header_mac(base_header)?.finalize().into_bytes();
        self.header_integrity
            .copy_from_slice(&tag[..INTEGRITY_SIZE]);

        let mut trailer = Vec::with_capacity(MODULE_FILE_HEADER_SIZE);
        trailer.extend_from_slice(&self.header_integrity);
        trailer.extend_from_slice(&self.global_iv);
        Ok(trailer)
    }

    fn check_integrity(&self, base_header: &[u8]) -> EvfsResult<bool> {
        Ok(self
            .header_mac(base_header)?
            .verify_truncated_left(&self.header_integrity)
            .is_ok())
    }

    fn encrypt_chunk(&self, index: u32, plain: &[u8]) -> EvfsResult<Vec<u8>> {
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[8..12].copy_from_slice(&index.to_be_bytes());
        self.build(header, plain)
    }

    fn reencrypt_chunk(&self, index: u32, existing: &[u8], plain: &[u8]) -> EvfsResult<Vec<u8>> {
        self.verify(index, existing)?;
        let count = u32::from_be_bytes([existing[12], existing[13], existing[14], existing[15]]);

        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[8..12].copy_from_slice(&index.to_be_bytes());
        header[12..16].copy_from_slice(&count.wrapping_add(1).to_be_bytes());
        tracing::trace!(index, count = count.wrapping_add(1), "dummy chunk re-encrypted");
        self.build(header, plain)
    }

    fn decrypt_chunk(&self, index: u32, raw: &[u8]) -> EvfsResult<Vec<u8>> {
        self.verify(index, raw)?;
        let mut plain = raw[CHUNK_HEADER_SIZE..].to_vec();
        self.apply_keystream(&raw[..CHUNK_HEADER_SIZE], &mut plain)?;
        Ok(plain)
    }
}
