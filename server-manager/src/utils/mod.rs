//! Utility modules for the server manager.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ManagerError, Result};
