use std::path::PathBuf;

use thiserror::Error;

pub type EvfsResult<T> = Result<T, EvfsError>;

#[derive(Debug, Error)]
pub enum EvfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk tag or the file header tag did not verify.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// The caller asked for a suite or chunk size that differs from what the
    /// file already committed to.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    #[error("secret material must be {expected} bytes, got {actual}")]
    KeySize { expected: usize, actual: usize },

    #[error("migrating {} to an encrypted file failed: {source}", path.display())]
    MigrationFailed {
        path: PathBuf,
        #[source]
        source: Box<EvfsError>,
    },

    #[error("unsupported encryption suite: {0:#06x}")]
    UnsupportedSuite(u16),

    #[error("malformed encrypted file: {0}")]
    Format(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EvfsError {
    /// True for errors raised by a failed tag verification.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, EvfsError::AuthFailure(_))
    }
}
