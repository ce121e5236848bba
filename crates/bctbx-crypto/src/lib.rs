//! bctbx-crypto: cipher suites for the bctoolbox encrypted VFS
//!
//! Each encrypted file carries one [`EncryptionModule`] selected by the suite
//! id in its header. The module owns every secret for that file and turns
//! plaintext chunks into self-authenticating raw chunks.
//!
//! Key hierarchy for AES-256-GCM/SHA-256:
//! ```text
//! Master Key (256-bit, supplied by the open policy)
//!   ├── File Header Key = HKDF-SHA256(salt=file_salt, info="EVFS file Header")
//!   │   └── header tag: HMAC-SHA256 over the 29-byte base header
//!   └── Chunk Key(i)   = HKDF-SHA256(salt=file_salt || be32(i), info="EVFS chunk")
//!       └── AES-256-GCM (random 96-bit IV per write, empty AAD)
//! ```

pub mod aes256gcm_sha256;
pub mod dummy;
pub mod keys;
pub mod module;

pub use aes256gcm_sha256::Aes256GcmSha256;
pub use dummy::DummyModule;
pub use keys::{hkdf_derive, MasterKey};
pub use module::{
    chunk_header_size, module_file_header_size, new_module, open_module, secret_material_size,
    EncryptionModule,
};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV
pub const IV_SIZE: usize = 12;

/// Size of an AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the per-file HKDF salt
pub const SALT_SIZE: usize = 16;

/// Size of an HMAC-SHA256 output
pub const HMAC_SIZE: usize = 32;
