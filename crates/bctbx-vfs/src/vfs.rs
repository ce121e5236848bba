//! VFS implementations and the registry that names them

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bctbx_core::{EvfsError, EvfsResult, OpenFlags};
use tracing::{debug, error};

use crate::backing::{BackingFile, StdBackingFile};
use crate::encrypted::EncryptedFile;
use crate::file::VfsFile;
use crate::settings::OpenPolicy;
use crate::{ENCRYPTED_VFS_NAME, STANDARD_VFS_NAME};

/// Operations every open file supports, whatever VFS opened it.
///
/// Offsets and sizes are plaintext ones.
pub trait FileOps: Send {
    /// Read up to `count` bytes at `offset`. Short only at end of file.
    fn read_at(&mut self, offset: u64, count: usize) -> EvfsResult<Vec<u8>>;

    fn write_at(&mut self, data: &[u8], offset: u64) -> EvfsResult<usize>;

    fn size(&self) -> EvfsResult<u64>;

    fn truncate(&mut self, size: u64) -> EvfsResult<()>;

    fn sync(&mut self) -> EvfsResult<()>;

    fn is_encrypted(&self) -> bool;

    fn close(self: Box<Self>) -> EvfsResult<()>;
}

/// A named way of opening files.
pub trait Vfs: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, path: &Path, flags: OpenFlags) -> EvfsResult<Box<dyn FileOps>>;
}

// ── Standard VFS ─────────────────────────────────────────────────────────────

/// A plain OS file.
#[derive(Debug)]
pub struct StandardFile {
    backing: StdBackingFile,
}

impl StandardFile {
    pub fn open(path: &Path, flags: OpenFlags) -> EvfsResult<Self> {
        Ok(Self {
            backing: StdBackingFile::open(path, flags)?,
        })
    }
}

impl FileOps for StandardFile {
    fn read_at(&mut self, offset: u64, count: usize) -> EvfsResult<Vec<u8>> {
        Ok(self.backing.read_at(offset, count)?)
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> EvfsResult<usize> {
        self.backing.write_at(offset, data)?;
        Ok(data.len())
    }

    fn size(&self) -> EvfsResult<u64> {
        Ok(self.backing.size()?)
    }

    fn truncate(&mut self, size: u64) -> EvfsResult<()> {
        Ok(self.backing.truncate(size)?)
    }

    fn sync(&mut self) -> EvfsResult<()> {
        Ok(self.backing.sync()?)
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn close(self: Box<Self>) -> EvfsResult<()> {
        Ok(())
    }
}

/// Opens files directly on the OS file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardVfs;

impl Vfs for StandardVfs {
    fn name(&self) -> &str {
        STANDARD_VFS_NAME
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> EvfsResult<Box<dyn FileOps>> {
        Ok(Box::new(StandardFile::open(path, flags)?))
    }
}

// ── Encrypted VFS ────────────────────────────────────────────────────────────

impl FileOps for EncryptedFile {
    fn read_at(&mut self, offset: u64, count: usize) -> EvfsResult<Vec<u8>> {
        self.read(offset, count)
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> EvfsResult<usize> {
        self.write(data, offset)
    }

    fn size(&self) -> EvfsResult<u64> {
        EncryptedFile::size(self)
    }

    fn truncate(&mut self, size: u64) -> EvfsResult<()> {
        EncryptedFile::truncate(self, size)
    }

    fn sync(&mut self) -> EvfsResult<()> {
        EncryptedFile::sync(self)
    }

    fn is_encrypted(&self) -> bool {
        EncryptedFile::is_encrypted(self)
    }

    fn close(self: Box<Self>) -> EvfsResult<()> {
        EncryptedFile::close(*self)
    }
}

/// Opens files through the encrypted file engine, consulting its policy on
/// every open.
#[derive(Clone)]
pub struct EncryptedVfs {
    policy: Arc<dyn OpenPolicy>,
}

impl EncryptedVfs {
    pub fn new(policy: impl OpenPolicy + 'static) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn with_policy(policy: Arc<dyn OpenPolicy>) -> Self {
        Self { policy }
    }
}

impl std::fmt::Debug for EncryptedVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedVfs").finish_non_exhaustive()
    }
}

impl Vfs for EncryptedVfs {
    fn name(&self) -> &str {
        ENCRYPTED_VFS_NAME
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> EvfsResult<Box<dyn FileOps>> {
        let file = EncryptedFile::open(path, flags, self.policy.as_ref()).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "encrypted open failed");
        })?;
        Ok(Box::new(file))
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// VFS instances by name, plus the one used when no name is given.
///
/// A fresh registry holds the standard VFS as its default.
pub struct VfsRegistry {
    entries: HashMap<String, Arc<dyn Vfs>>,
    default: Arc<dyn Vfs>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        let standard: Arc<dyn Vfs> = Arc::new(StandardVfs);
        let mut entries = HashMap::new();
        entries.insert(standard.name().to_string(), Arc::clone(&standard));
        Self {
            entries,
            default: standard,
        }
    }

    /// Add a VFS under its own name, returning the one it replaces.
    pub fn register(&mut self, vfs: Arc<dyn Vfs>) -> Option<Arc<dyn Vfs>> {
        let name = vfs.name().to_string();
        if self.default.name() == name {
            self.default = Arc::clone(&vfs);
        }
        debug!(vfs = %name, "registered vfs");
        self.entries.insert(name, vfs)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Vfs>> {
        self.entries.get(name).cloned()
    }

    /// Make a registered VFS the default.
    pub fn set_default(&mut self, name: &str) -> EvfsResult<()> {
        let vfs = self
            .get(name)
            .ok_or_else(|| EvfsError::InvalidArgument(format!("no vfs registered as {name:?}")))?;
        self.default = vfs;
        Ok(())
    }

    pub fn default_vfs(&self) -> Arc<dyn Vfs> {
        Arc::clone(&self.default)
    }

    /// Open `path` through the default VFS with an fopen-style `mode`.
    pub fn open(&self, path: &Path, mode: &str) -> EvfsResult<VfsFile> {
        let flags = OpenFlags::from_mode(mode)?;
        Ok(VfsFile::new(self.default.open(path, flags)?))
    }

    /// Open `path` through the VFS registered as `name`.
    pub fn open_with(&self, name: &str, path: &Path, flags: OpenFlags) -> EvfsResult<VfsFile> {
        let vfs = self
            .get(name)
            .ok_or_else(|| EvfsError::InvalidArgument(format!("no vfs registered as {name:?}")))?;
        Ok(VfsFile::new(vfs.open(path, flags)?))
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EncryptionSettings;
    use bctbx_core::EncryptionSuite;
    use tempfile::TempDir;

    fn dummy_vfs() -> Arc<dyn Vfs> {
        Arc::new(EncryptedVfs::new(|s: &mut EncryptionSettings| {
            s.set_suite(EncryptionSuite::Dummy)?;
            s.set_secret_material(&[0xFF; 16])
        }))
    }

    #[test]
    fn test_registry_defaults_to_standard() {
        let registry = VfsRegistry::new();
        assert_eq!(registry.default_vfs().name(), "bctbx_vfs");
        assert!(registry.get("bctbx_vfs").is_some());
        assert!(registry.get("bctbx_encrypted_vfs").is_none());
    }

    #[test]
    fn test_set_default_requires_registration() {
        let mut registry = VfsRegistry::new();
        assert!(matches!(
            registry.set_default("bctbx_encrypted_vfs"),
            Err(EvfsError::InvalidArgument(_))
        ));

        assert!(registry.register(dummy_vfs()).is_none());
        registry.set_default("bctbx_encrypted_vfs").unwrap();
        assert_eq!(registry.default_vfs().name(), "bctbx_encrypted_vfs");

        // re-registering the default replaces it too
        assert!(registry.register(dummy_vfs()).is_some());
        assert_eq!(registry.default_vfs().name(), "bctbx_encrypted_vfs");
    }

    #[test]
    fn test_open_through_each_vfs() {
        let dir = TempDir::new().unwrap();
        let mut registry = VfsRegistry::new();
        registry.register(dummy_vfs());

        let plain = dir.path().join("plain.txt");
        let mut file = registry.open(&plain, "w+").unwrap();
        assert!(!file.is_encrypted());
        file.write(b"hello").unwrap();
        file.close().unwrap();
        assert_eq!(std::fs::read(&plain).unwrap(), b"hello");

        let secret = dir.path().join("secret.db");
        let mut file = registry
            .open_with("bctbx_encrypted_vfs", &secret, OpenFlags::create())
            .unwrap();
        assert!(file.is_encrypted());
        file.write(b"hello").unwrap();
        file.close().unwrap();
        assert!(std::fs::read(&secret).unwrap().starts_with(b"bcEncryptedFs"));
    }

    #[test]
    fn test_unknown_mode_and_vfs() {
        let dir = TempDir::new().unwrap();
        let registry = VfsRegistry::new();
        let path = dir.path().join("x");

        assert!(matches!(
            registry.open(&path, "rw"),
            Err(EvfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.open_with("nope", &path, OpenFlags::create()),
            Err(EvfsError::InvalidArgument(_))
        ));
    }
}
