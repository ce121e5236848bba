//! Open-time encryption settings and the policy that fills them in

use std::path::{Path, PathBuf};

use bctbx_core::config::{VfsConfig, DEFAULT_CHUNK_SIZE};
use bctbx_core::{AccessMode, EncryptionSuite, EvfsError, EvfsResult};
use zeroize::Zeroizing;

use crate::header::validate_chunk_size;

/// What to do with an existing plaintext file opened through the encrypted VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPolicy {
    /// Encrypt it in place when a suite is selected and the file is writable
    #[default]
    Migrate,
    /// Leave it plaintext
    Never,
}

/// Settings negotiated between a file being opened and the open policy.
///
/// For an existing encrypted file the suite and chunk size are already
/// committed by its header; the policy may read them but cannot change them.
pub struct EncryptionSettings {
    path: PathBuf,
    access: AccessMode,
    plain_file: bool,
    committed_suite: Option<EncryptionSuite>,
    committed_chunk_size: Option<u32>,
    suite: EncryptionSuite,
    chunk_size: Option<u32>,
    secret: Option<Zeroizing<Vec<u8>>>,
    migration: MigrationPolicy,
}

impl EncryptionSettings {
    fn blank(path: &Path, access: AccessMode) -> Self {
        Self {
            path: path.to_path_buf(),
            access,
            plain_file: false,
            committed_suite: None,
            committed_chunk_size: None,
            suite: EncryptionSuite::Unset,
            chunk_size: None,
            secret: None,
            migration: MigrationPolicy::default(),
        }
    }

    /// Settings for a file that is being created.
    pub fn for_new_file(path: &Path, access: AccessMode) -> Self {
        Self::blank(path, access)
    }

    /// Settings for an existing file without an encrypted header.
    pub fn for_plain_file(path: &Path, access: AccessMode) -> Self {
        let mut settings = Self::blank(path, access);
        settings.plain_file = true;
        if access == AccessMode::ReadOnly {
            settings.migration = MigrationPolicy::Never;
        }
        settings
    }

    /// Settings for an existing encrypted file.
    pub fn for_encrypted_file(
        path: &Path,
        access: AccessMode,
        suite: EncryptionSuite,
        chunk_size: u32,
    ) -> Self {
        let mut settings = Self::blank(path, access);
        settings.committed_suite = Some(suite);
        settings.committed_chunk_size = Some(chunk_size);
        settings.suite = suite;
        settings.chunk_size = Some(chunk_size);
        settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name as a string, for policies that pick a suite by name.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// True when opening an existing file that holds plaintext.
    pub fn is_plain_file(&self) -> bool {
        self.plain_file
    }

    pub fn suite(&self) -> EncryptionSuite {
        self.suite
    }

    pub fn set_suite(&mut self, suite: EncryptionSuite) -> EvfsResult<()> {
        if let Some(committed) = self.committed_suite {
            if committed != suite {
                return Err(EvfsError::ConfigConflict(format!(
                    "{} is encrypted with {committed}, cannot switch it to {suite}",
                    self.path.display()
                )));
            }
        }
        if self.suite != suite {
            self.secret = None;
        }
        self.suite = suite;
        Ok(())
    }

    /// Plaintext bytes per chunk (default: 4096).
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn set_chunk_size(&mut self, size: u32) -> EvfsResult<()> {
        validate_chunk_size(size)?;
        if let Some(committed) = self.committed_chunk_size {
            if committed != size {
                return Err(EvfsError::ConfigConflict(format!(
                    "{} uses {committed}-byte chunks, cannot switch it to {size}",
                    self.path.display()
                )));
            }
        }
        self.chunk_size = Some(size);
        Ok(())
    }

    /// Install the secret for the selected suite. The length must match what
    /// the suite expects.
    pub fn set_secret_material(&mut self, secret: &[u8]) -> EvfsResult<()> {
        if !self.suite.is_encrypting() {
            return Err(EvfsError::ConfigConflict(format!(
                "select an encryption suite for {} before its secret material",
                self.path.display()
            )));
        }
        let expected = bctbx_crypto::secret_material_size(self.suite)?;
        if secret.len() != expected {
            return Err(EvfsError::KeySize {
                expected,
                actual: secret.len(),
            });
        }
        self.secret = Some(Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    pub(crate) fn secret_material(&self) -> Option<&[u8]> {
        self.secret.as_deref().map(Vec::as_slice)
    }

    pub fn migration_policy(&self) -> MigrationPolicy {
        self.migration
    }

    /// Read-only opens always keep `Never`.
    pub fn set_migration_policy(&mut self, policy: MigrationPolicy) {
        if self.access != AccessMode::ReadOnly {
            self.migration = policy;
        }
    }

    /// Apply the defaults from a `[vfs]` config section: suite and chunk size
    /// for new files, migration of plaintext files.
    pub fn apply_config(&mut self, config: &VfsConfig) -> EvfsResult<()> {
        if self.committed_suite.is_none() {
            self.set_suite(config.default_suite)?;
            self.set_chunk_size(config.chunk_size)?;
        }
        if !config.migrate_plain_files {
            self.set_migration_policy(MigrationPolicy::Never);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("suite", &self.suite)
            .field("chunk_size", &self.chunk_size())
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("migration", &self.migration)
            .finish()
    }
}

/// Supplies encryption settings whenever the encrypted VFS opens a file.
///
/// Closures `Fn(&mut EncryptionSettings) -> EvfsResult<()>` implement this.
pub trait OpenPolicy: Send + Sync {
    fn configure(&self, settings: &mut EncryptionSettings) -> EvfsResult<()>;
}

impl<F> OpenPolicy for F
where
    F: Fn(&mut EncryptionSettings) -> EvfsResult<()> + Send + Sync,
{
    fn configure(&self, settings: &mut EncryptionSettings) -> EvfsResult<()> {
        self(settings)
    }
}
