//! Key material: the per-file master secret and HKDF-SHA256 derived keys

use bctbx_core::{EvfsError, EvfsResult};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

/// The 256-bit master secret handed to a module by the open policy.
///
/// Zeroized on drop to prevent secrets lingering in memory.
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy a secret of exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(secret: &[u8]) -> EvfsResult<Self> {
        if secret.len() != KEY_SIZE {
            return Err(EvfsError::KeySize {
                expected: KEY_SIZE,
                actual: secret.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(secret);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// HKDF-SHA256 with an explicit salt and a domain-specific info string.
pub fn hkdf_derive(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> EvfsResult<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| EvfsError::InvalidArgument(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
