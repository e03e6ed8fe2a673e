//! # scriptlink-app - Orchestration
//!
//! Wires the daemon pieces into one application: configuration, the session
//! registry with per-device logs, project transfers, script commands, and the
//! [`AppContext`] event loop that connects tracker, forwards, tunnels and
//! sessions.
//!
//! ## Public API
//!
//! - [`AppContext`] - Constructed once; drives the server and ADB lifecycle
//! - [`ServerEvent`] - Everything observers are told about
//! - [`SessionRegistry`] - Attached sessions and fan-out sends
//! - [`TransferJob`] - One cancellable project transfer
//! - [`commands`] - Script commands and `/exec` routing
//! - [`config`] - `config.toml` loading

pub mod commands;
pub mod config;
pub mod context;
pub mod device_log;
pub mod event;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod transfer;

pub use config::Settings;
pub use context::{AppContext, EventSources};
pub use device_log::DeviceLog;
pub use event::ServerEvent;
pub use registry::{BroadcastReport, SessionRegistry};
pub use transfer::{TransferJob, TransferPhase, TransferProgress};
