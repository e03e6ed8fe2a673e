//! # scriptlink-daemon - Device Transport and ADB Orchestration
//!
//! Everything that touches a wire or an external process: the device envelope
//! protocol, device sessions, the listening socket, ADB tracking and port
//! forwarding, and the `zip`-backed project packer.
//!
//! Depends on [`scriptlink_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Sessions
//! - [`spawn_session()`] - Run a device session over any websocket transport
//! - [`SessionHandle`] - Send envelopes, bytes and commands to one device
//! - [`SessionEvent`] - Attach, message, log and disconnect notifications
//!
//! ### Transports
//! - [`Listener`] - `GET /exec` plus socket upgrade on one port
//! - [`connect_tunnel()`] - Outbound session through an ADB forward
//!
//! ### ADB
//! - [`AdbBridge`] - Toolkit primitives; [`AdbCli`] drives the `adb` binary
//! - [`AdbTracker`] - Device attach/detach lifecycle
//! - [`ForwardAllocator`] - Idempotent port forwards
//! - [`AdbHandle`] - Per-device capability handed to transfers
//!
//! ### Protocol
//! - [`Envelope`], [`InboundMessage`], [`parse_inbound()`]

pub mod adb;
pub mod archive;
pub mod protocol;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tunnel;

// Public API re-exports
pub use adb::{
    AdbBridge, AdbCli, AdbDevice, AdbHandle, AdbTracker, ForwardAllocator, LocalAdbBridge,
    TrackerChange, TrackerEvent,
};
pub use archive::{ZipCommandPacker, ZipWatch};
pub use protocol::{parse_inbound, Envelope, HelloData, InboundMessage, LogData};
pub use server::{ExecRequest, Listener};
pub use session::{spawn_session, SessionConfig, SessionEvent, SessionHandle};
pub use tunnel::connect_tunnel;
