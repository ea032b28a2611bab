//! Core types shared by the sift mining and semantic indexing crates.
//!
//! This crate provides the foundational pieces used across all sift
//! components: the error type, job identifiers, an injectable clock,
//! content hashing and configuration loading.

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GeneralConfig, LogFormat};
pub use error::{Result, SiftError};
pub use hash::{composite_hash, content_hash};
pub use id::JobId;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{GeneralConfig, LogFormat};
    pub use crate::error::{Result, SiftError};
    pub use crate::hash::{composite_hash, content_hash};
    pub use crate::id::JobId;
}
