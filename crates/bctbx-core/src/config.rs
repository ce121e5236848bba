use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EvfsError, EvfsResult};
use crate::types::EncryptionSuite;

/// Default plaintext payload per chunk
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

/// Top-level configuration (loaded from bctbx.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BctbxConfig {
    pub vfs: VfsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Suite used for newly created or migrated files (default: aes256gcm128-sha256)
    pub default_suite: EncryptionSuite,
    /// Plaintext bytes per chunk, a multiple of 16 (default: 4096)
    pub chunk_size: u32,
    /// Encrypt existing plaintext files in place when opened writable (default: true)
    pub migrate_plain_files: bool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            default_suite: EncryptionSuite::Aes256Gcm128Sha256,
            chunk_size: DEFAULT_CHUNK_SIZE,
            migrate_plain_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl BctbxConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> EvfsResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: BctbxConfig = toml::from_str(&content)
            .map_err(|e| EvfsError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EvfsResult<()> {
        let size = self.vfs.chunk_size;
        if size == 0 || size % 16 != 0 || size > 0xFFFF * 16 {
            return Err(EvfsError::Config(format!(
                "vfs.chunk_size must be a non-zero multiple of 16 no larger than {}, got {size}",
                0xFFFF * 16
            )));
        }
        if self.vfs.default_suite == EncryptionSuite::Unset {
            return Err(EvfsError::Config(
                "vfs.default_suite must name a suite".into(),
            ));
        }
        match self.log.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(EvfsError::Config(format!(
                "log.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[vfs]
default_suite = "dummy"
chunk_size = 16
migrate_plain_files = false

[log]
level = "debug"
format = "json"
"#;
        let config: BctbxConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.vfs.default_suite, EncryptionSuite::Dummy);
        assert_eq!(config.vfs.chunk_size, 16);
        assert!(!config.vfs.migrate_plain_files);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: BctbxConfig = toml::from_str("").unwrap();

        assert_eq!(
            config.vfs.default_suite,
            EncryptionSuite::Aes256Gcm128Sha256
        );
        assert_eq!(config.vfs.chunk_size, 4096);
        assert!(config.vfs.migrate_plain_files);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[vfs]
chunk_size = 8192
"#;
        let config: BctbxConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.vfs.chunk_size, 8192);
        // Defaults
        assert!(config.vfs.migrate_plain_files);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_reject_unaligned_chunk_size() {
        let mut config = BctbxConfig::default();
        config.vfs.chunk_size = 100;
        assert!(matches!(config.validate(), Err(EvfsError::Config(_))));

        config.vfs.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = BctbxConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.vfs.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_load_rejects_bad_log_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bctbx.toml");
        std::fs::write(&path, "[log]\nformat = \"xml\"\n").unwrap();

        assert!(matches!(
            BctbxConfig::load(&path),
            Err(EvfsError::Config(_))
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = BctbxConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BctbxConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.vfs.default_suite, parsed.vfs.default_suite);
        assert_eq!(config.vfs.chunk_size, parsed.vfs.chunk_size);
        assert_eq!(config.log.format, parsed.log.format);
    }
}
