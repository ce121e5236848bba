//! bctbx-vfs: virtual file system layer with transparent file encryption
//!
//! Files are opened through a [`Vfs`]: the standard VFS maps straight onto the
//! OS, the encrypted VFS stores content as authenticated chunks behind a
//! `bcEncryptedFs` header. A [`VfsRegistry`] holds the VFS instances by name,
//! and [`VfsFile`] adds a cursor and the print/line caches on top of either.

pub mod backing;
pub mod encrypted;
pub mod file;
pub mod header;
pub mod layout;
mod migrate;
pub mod settings;
pub mod vfs;

pub use backing::{BackingFile, StdBackingFile};
pub use encrypted::EncryptedFile;
pub use file::VfsFile;
pub use header::FileHeader;
pub use settings::{EncryptionSettings, MigrationPolicy, OpenPolicy};
pub use vfs::{EncryptedVfs, FileOps, StandardFile, StandardVfs, Vfs, VfsRegistry};

/// Name of the standard VFS in a registry
pub const STANDARD_VFS_NAME: &str = "bctbx_vfs";

/// Name of the encrypted VFS in a registry
pub const ENCRYPTED_VFS_NAME: &str = "bctbx_encrypted_vfs";
