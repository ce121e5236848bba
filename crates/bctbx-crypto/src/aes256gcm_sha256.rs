//! AES-256-GCM chunk encryption with an HKDF/HMAC-SHA256 key schedule
//!
//! Module file header (48 bytes, after the base header):
//! ```text
//! [32 bytes: HMAC-SHA256(file_header_key, base_header)][16 bytes: file salt]
//! ```
//!
//! Raw chunk:
//! ```text
//! [16 bytes: GCM tag][12 bytes: random IV][N bytes: ciphertext]
//! ```
//!
//! Every chunk is encrypted under its own key, derived from the master key,
//! the file salt and the chunk index, so a chunk moved to another position or
//! another file fails authentication.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use bctbx_core::{EncryptionSuite, EvfsError, EvfsResult};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::keys::{hkdf_derive, MasterKey};
use crate::module::EncryptionModule;
use crate::{HMAC_SIZE, IV_SIZE, KEY_SIZE, SALT_SIZE, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

pub const MODULE_FILE_HEADER_SIZE: usize = HMAC_SIZE + SALT_SIZE;
pub const CHUNK_HEADER_SIZE: usize = TAG_SIZE + IV_SIZE;

const FILE_HEADER_INFO: &[u8] = b"EVFS file Header";
const CHUNK_INFO: &[u8] = b"EVFS chunk";

pub struct Aes256GcmSha256 {
    file_salt: [u8; SALT_SIZE],
    header_tag: [u8; HMAC_SIZE],
    master_key: Option<MasterKey>,
    header_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl Aes256GcmSha256 {
    /// A module for a new file, with a fresh random salt.
    pub fn new() -> Self {
        let mut file_salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut file_salt);
        Self {
            file_salt,
            header_tag: [0u8; HMAC_SIZE],
            master_key: None,
            header_key: None,
        }
    }

    /// Rebuild the module from the trailer stored in an existing file.
    pub fn from_module_header(module_header: &[u8]) -> EvfsResult<Self> {
        if module_header.len() != MODULE_FILE_HEADER_SIZE {
            return Err(EvfsError::Format(format!(
                "AES-256-GCM module header is {} bytes (expected {MODULE_FILE_HEADER_SIZE})",
                module_header.len()
            )));
        }
        let (tag, salt) = module_header.split_at(HMAC_SIZE);
        let mut header_tag = [0u8; HMAC_SIZE];
        header_tag.copy_from_slice(tag);
        let mut file_salt = [0u8; SALT_SIZE];
        file_salt.copy_from_slice(salt);
        Ok(Self {
            file_salt,
            header_tag,
            master_key: None,
            header_key: None,
        })
    }

    fn master_key(&self) -> EvfsResult<&MasterKey> {
        self.master_key.as_ref().ok_or_else(|| {
            EvfsError::InvalidArgument("AES-256-GCM module used before its secret material was set".into())
        })
    }

    fn header_mac(&self) -> EvfsResult<HmacSha256> {
        let key = self.header_key.as_ref().ok_or_else(|| {
            EvfsError::InvalidArgument("AES-256-GCM module used before its secret material was set".into())
        })?;
        <HmacSha256 as Mac>::new_from_slice(&key[..])
            .map_err(|e| EvfsError::InvalidArgument(format!("HMAC key rejected: {e}")))
    }

    fn chunk_cipher(&self, index: u32) -> EvfsResult<Aes256Gcm> {
        let mut salt = [0u8; SALT_SIZE + 4];
        salt[..SALT_SIZE].copy_from_slice(&self.file_salt);
        salt[SALT_SIZE..].copy_from_slice(&index.to_be_bytes());
        let chunk_key = hkdf_derive(&salt, self.master_key()?.as_bytes(), CHUNK_INFO)?;
        Aes256Gcm::new_from_slice(&chunk_key[..])
            .map_err(|_| EvfsError::InvalidArgument("invalid AES-256 key length".into()))
    }
}

impl Default for Aes256GcmSha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Aes256GcmSha256 {
    fn drop(&mut self) {
        self.file_salt.zeroize();
        self.header_tag.zeroize();
    }
}

impl EncryptionModule for Aes256GcmSha256 {
    fn suite(&self) -> EncryptionSuite {
        EncryptionSuite::Aes256Gcm128Sha256
    }

    fn module_file_header_size(&self) -> usize {
        MODULE_FILE_HEADER_SIZE
    }

    fn chunk_header_size(&self) -> usize {
        CHUNK_HEADER_SIZE
    }

    fn secret_material_size(&self) -> usize {
        KEY_SIZE
    }

    fn set_secret_material(&mut self, secret: &[u8]) -> EvfsResult<()> {
        let master = MasterKey::from_slice(secret)?;
        self.header_key = Some(hkdf_derive(
            &self.file_salt,
            master.as_bytes(),
            FILE_HEADER_INFO,
        )?);
        self.master_key = Some(master);
        Ok(())
    }

    fn has_secret_material(&self) -> bool {
        self.master_key.is_some()
    }

    fn module_file_header(&mut self, base_header: &[u8]) -> EvfsResult<Vec<u8>> {
        let mut mac = self.header_mac()?;
        mac.update(base_header);
        self.header_tag
            .copy_from_slice(&mac.finalize().into_bytes());

        let mut trailer = Vec::with_capacity(MODULE_FILE_HEADER_SIZE);
        trailer.extend_from_slice(&self.header_tag);
        trailer.extend_from_slice(&self.file_salt);
        Ok(trailer)
    }

    fn check_integrity(&self, base_header: &[u8]) -> EvfsResult<bool> {
        let mut mac = self.header_mac()?;
        mac.update(base_header);
        Ok(mac.verify_slice(&self.header_tag).is_ok())
    }

    fn encrypt_chunk(&self, index: u32, plain: &[u8]) -> EvfsResult<Vec<u8>> {
        let cipher = self.chunk_cipher(index)?;

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plain,
                    aad: b"",
                },
            )
            .map_err(|e| EvfsError::InvalidArgument(format!("chunk {index} encryption failed: {e}")))?;

        // aes-gcm appends the tag; on disk it leads the chunk.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let mut raw = Vec::with_capacity(CHUNK_HEADER_SIZE + ciphertext.len());
        raw.extend_from_slice(tag);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(ciphertext);
        Ok(raw)
    }

    fn decrypt_chunk(&self, index: u32, raw: &[u8]) -> EvfsResult<Vec<u8>> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(EvfsError::AuthFailure(format!(
                "chunk {index} too short: {} bytes (minimum {CHUNK_HEADER_SIZE})",
                raw.len()
            )));
        }
        let cipher = self.chunk_cipher(index)?;

        let (tag, rest) = raw.split_at(TAG_SIZE);
        let (iv, ciphertext) = rest.split_at(IV_SIZE);
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: &sealed,
                    aad: b"",
                },
            )
            .map_err(|_| EvfsError::AuthFailure(format!("chunk {index} failed authentication")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0xf0, 0x11, 0x12, 0x13, 0x54, 0x55, 0x56, 0xa7, 0xa8, 0xa9, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff, 0xef,
    ];

    fn keyed_module() -> Aes256GcmSha256 {
        let mut module = Aes256GcmSha256::new();
        module.set_secret_material(&KEY).unwrap();
        module
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let module = keyed_module();
        let plaintext = b"hello, encrypted world!";

        let raw = module.encrypt_chunk(3, plaintext).unwrap();
        let decrypted = module.decrypt_chunk(3, &raw).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_chunk_key_schedule_is_wiped_on_drop() {
        fn wiped_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        wiped_on_drop::<aes::Aes256>();
    }

    #[test]
    fn test_raw_chunk_size() {
        let module = keyed_module();
        let raw = module.encrypt_chunk(0, &[0u8; 1000]).unwrap();

        // tag (16) + IV (12) + payload (1000)
        assert_eq!(raw.len(), CHUNK_HEADER_SIZE + 1000);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let module = keyed_module();
        let a = module.encrypt_chunk(0, b"same plaintext").unwrap();
        let b = module.encrypt_chunk(0, b"same plaintext").unwrap();

        assert_ne!(a[TAG_SIZE..CHUNK_HEADER_SIZE], b[TAG_SIZE..CHUNK_HEADER_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_chunk_index() {
        let module = keyed_module();
        let raw = module.encrypt_chunk(0, b"secret data").unwrap();

        let result = module.decrypt_chunk(1, &raw);
        assert!(
            matches!(result, Err(EvfsError::AuthFailure(_))),
            "chunk key is bound to its index"
        );
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let module = keyed_module();
        let raw = module.encrypt_chunk(0, b"secret data").unwrap();

        let trailer = [&[0u8; HMAC_SIZE][..], &module.file_salt[..]].concat();
        let mut same_salt = Aes256GcmSha256::from_module_header(&trailer).unwrap();
        same_salt.set_secret_material(&[0x55u8; 32]).unwrap();
        assert!(same_salt.decrypt_chunk(0, &raw).is_err());

        let other_salt = keyed_module();
        assert!(other_salt.decrypt_chunk(0, &raw).is_err(), "salt is part of the chunk key");
    }

    #[test]
    fn test_tampered_ciphertext() {
        let module = keyed_module();
        let mut raw = module.encrypt_chunk(0, b"secret data").unwrap();
        raw[CHUNK_HEADER_SIZE + 2] ^= 0xFF;

        assert!(module.decrypt_chunk(0, &raw).is_err(), "tampered ciphertext must fail");
    }

    #[test]
    fn test_tampered_tag() {
        let module = keyed_module();
        let mut raw = module.encrypt_chunk(0, b"secret data").unwrap();
        raw[0] ^= 0x01;

        assert!(module.decrypt_chunk(0, &raw).is_err());
    }

    #[test]
    fn test_truncated_chunk() {
        let module = keyed_module();
        let result = module.decrypt_chunk(0, &[0u8; CHUNK_HEADER_SIZE - 1]);
        assert!(matches!(result, Err(EvfsError::AuthFailure(_))));
    }

    #[test]
    fn test_secret_material_size() {
        let mut module = Aes256GcmSha256::new();
        assert!(!module.has_secret_material());

        let err = module.set_secret_material(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, EvfsError::KeySize { expected: 32, actual: 16 }));
        assert!(module.encrypt_chunk(0, b"x").is_err());
    }

    #[test]
    fn test_header_integrity_survives_reopen() {
        let base = [0x5Au8; 29];
        let mut writer = keyed_module();
        let trailer = writer.module_file_header(&base).unwrap();
        assert_eq!(trailer.len(), MODULE_FILE_HEADER_SIZE);

        let mut reader = Aes256GcmSha256::from_module_header(&trailer).unwrap();
        reader.set_secret_material(&KEY).unwrap();
        assert!(reader.check_integrity(&base).unwrap());

        let mut tampered = base;
        tampered[21] ^= 0x01;
        assert!(!reader.check_integrity(&tampered).unwrap());

        let raw = writer.encrypt_chunk(7, b"payload").unwrap();
        assert_eq!(reader.decrypt_chunk(7, &raw).unwrap(), b"payload");
    }

    #[test]
    fn test_header_integrity_wrong_key() {
        let base = [0x11u8; 29];
        let mut writer = keyed_module();
        let trailer = writer.module_file_header(&base).unwrap();

        let mut reader = Aes256GcmSha256::from_module_header(&trailer).unwrap();
        reader.set_secret_material(&[0u8; 32]).unwrap();
        assert!(!reader.check_integrity(&base).unwrap());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_flipped_byte_is_rejected(
                plain in proptest::collection::vec(any::<u8>(), 1..64),
                index in any::<u32>(),
                pos in any::<prop::sample::Index>(),
                bit in 0u8..8,
            ) {
                let module = keyed_module();
                let mut raw = module.encrypt_chunk(index, &plain).unwrap();
                prop_assert_eq!(module.decrypt_chunk(index, &raw).unwrap(), plain);

                let at = pos.index(raw.len());
                raw[at] ^= 1 << bit;
                prop_assert!(module.decrypt_chunk(index, &raw).unwrap_err().is_auth_failure());
            }
        }
    }
}
