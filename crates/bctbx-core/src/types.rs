use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EvfsError, EvfsResult};

/// Encryption suite identifiers, as stored in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionSuite {
    /// No suite chosen yet
    #[serde(rename = "unset")]
    Unset,
    /// XOR + truncated HMAC, test only
    #[serde(rename = "dummy")]
    Dummy,
    /// AES-256-GCM with a 128-bit tag, HKDF/HMAC-SHA256 key schedule
    #[serde(rename = "aes256gcm128-sha256")]
    Aes256Gcm128Sha256,
    /// Plaintext passthrough, never written to disk
    #[serde(rename = "plain")]
    Plain,
}

impl EncryptionSuite {
    pub const fn id(self) -> u16 {
        match self {
            EncryptionSuite::Unset => 0x0000,
            EncryptionSuite::Dummy => 0x0001,
            EncryptionSuite::Aes256Gcm128Sha256 => 0x0002,
            EncryptionSuite::Plain => 0xFFFF,
        }
    }

    pub fn from_id(id: u16) -> EvfsResult<Self> {
        match id {
            0x0000 => Ok(EncryptionSuite::Unset),
            0x0001 => Ok(EncryptionSuite::Dummy),
            0x0002 => Ok(EncryptionSuite::Aes256Gcm128Sha256),
            0xFFFF => Ok(EncryptionSuite::Plain),
            other => Err(EvfsError::UnsupportedSuite(other)),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            EncryptionSuite::Unset => "unset",
            EncryptionSuite::Dummy => "dummy",
            EncryptionSuite::Aes256Gcm128Sha256 => "aes256gcm128-sha256",
            EncryptionSuite::Plain => "plain",
        }
    }

    /// Suites backed by an encryption module.
    pub const fn is_encrypting(self) -> bool {
        matches!(
            self,
            EncryptionSuite::Dummy | EncryptionSuite::Aes256Gcm128Sha256
        )
    }
}

impl fmt::Display for EncryptionSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncryptionSuite {
    type Err = EvfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(EncryptionSuite::Unset),
            "dummy" => Ok(EncryptionSuite::Dummy),
            "aes256gcm128-sha256" => Ok(EncryptionSuite::Aes256Gcm128Sha256),
            "plain" => Ok(EncryptionSuite::Plain),
            other => Err(EvfsError::InvalidArgument(format!(
                "unknown encryption suite name: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Flags used to open a file through a VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const fn read_only() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            create: false,
            truncate: false,
            append: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            access: AccessMode::ReadWrite,
            create: false,
            truncate: false,
            append: false,
        }
    }

    /// Read-write, creating the file if missing.
    pub const fn create() -> Self {
        Self {
            access: AccessMode::ReadWrite,
            create: true,
            truncate: false,
            append: false,
        }
    }

    /// Parse an fopen-style mode string.
    ///
    /// | mode | access     | extra            |
    /// |------|------------|------------------|
    /// | `r`  | read-only  |                  |
    /// | `r+` | read-write |                  |
    /// | `w`  | write-only | create, truncate |
    /// | `w+` | read-write | create           |
    /// | `a`  | write-only | append           |
    /// | `a+` | read-write | append           |
    ///
    /// A `b` anywhere in the mode is ignored.
    pub fn from_mode(mode: &str) -> EvfsResult<Self> {
        let normalized: String = mode.chars().filter(|c| *c != 'b').collect();
        let flags = match normalized.as_str() {
            "r" => Self::read_only(),
            "r+" => Self::read_write(),
            "w" => Self {
                access: AccessMode::WriteOnly,
                create: true,
                truncate: true,
                append: false,
            },
            "w+" => Self::create(),
            "a" => Self {
                access: AccessMode::WriteOnly,
                create: false,
                truncate: false,
                append: true,
            },
            "a+" => Self {
                access: AccessMode::ReadWrite,
                create: false,
                truncate: false,
                append: true,
            },
            _ => {
                return Err(EvfsError::InvalidArgument(format!(
                    "invalid open mode: {mode:?}"
                )))
            }
        };
        Ok(flags)
    }

    pub const fn is_writable(&self) -> bool {
        !matches!(self.access, AccessMode::ReadOnly)
    }

    pub const fn is_readable(&self) -> bool {
        !matches!(self.access, AccessMode::WriteOnly)
    }
}
