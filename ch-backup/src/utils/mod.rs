//! Utility modules shared by the backup components.

pub mod errors;
pub mod format;
pub mod logger;
pub mod retry;

pub use errors::{BackupError, Result};
