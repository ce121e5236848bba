pub mod config;
pub mod error;
pub mod types;

pub use error::{EvfsError, EvfsResult};
pub use types::{AccessMode, EncryptionSuite, OpenFlags};
