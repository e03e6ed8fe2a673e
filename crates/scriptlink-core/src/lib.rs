//! # scriptlink-core - Core Domain Types
//!
//! Foundation crate for scriptlink. Provides the device/session domain types,
//! error handling, logging bootstrap, content hashing, and the contract through
//! which an external project diff engine is consumed.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing, xxhash-rust).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`DeviceIdentity`] - Who a session talks to (id, transport kind, display name)
//! - [`TransportKind`] - `Direct` socket or `AdbTunnel`
//! - [`SessionState`] - `Connecting -> Handshaking -> Attached -> Closed`
//! - [`TrackerState`] - ADB tracker lifecycle (`Idle`, `Tracking`, `Error`)
//! - [`ForwardMapping`] - A local-port to device-port TCP forward
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Project Payloads (`project`, `hash`)
//! - [`ProjectDiff`] - Packed project bytes plus their content hash
//! - [`ProjectWatch`], [`ProjectPacker`] - The diff engine contract
//! - [`content_hash()`] - Fingerprint used to correlate binary frames
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use scriptlink_core::prelude::*;
//! ```

pub mod error;
pub mod hash;
pub mod logging;
pub mod project;
pub mod types;

/// Prelude for common imports used throughout all scriptlink crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result, ResultExt};
pub use hash::content_hash;
pub use project::{BoundWatch, LocalProjectWatch, ProjectDiff, ProjectPacker, ProjectWatch};
pub use types::{DeviceIdentity, ForwardMapping, SessionState, TrackerState, TransportKind};
