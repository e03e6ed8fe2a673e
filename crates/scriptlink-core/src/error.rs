//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Listener Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Server error: {message}")]
    Server { message: String },

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Session for {device} is closed")]
    SessionClosed { device: String },

    #[error("No attached device with id: {id}")]
    DeviceNotFound { id: String },

    #[error("Device protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // ADB Errors
    // ─────────────────────────────────────────────────────────────
    #[error("adb not found. Ensure 'adb' is in your PATH or set [adb] path.")]
    AdbNotFound,

    #[error("adb error: {message}")]
    Adb { message: String },

    #[error("Failed to start ADB tracking: {message}")]
    TrackerStart { message: String },

    #[error("Failed to forward port for {device}: {message}")]
    Forward { device: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Transfer Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to send project to {device}: {message}")]
    Transfer { device: String, message: String },

    #[error("Project transfer cancelled by user")]
    TransferCancelled,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn session_closed(device: impl Into<String>) -> Self {
        Self::SessionClosed {
            device: device.into(),
        }
    }

    pub fn device_not_found(id: impl Into<String>) -> Self {
        Self::DeviceNotFound { id: id.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn adb(message: impl Into<String>) -> Self {
        Self::Adb {
            message: message.into(),
        }
    }

    pub fn tracker_start(message: impl Into<String>) -> Self {
        Self::TrackerStart {
            message: message.into(),
        }
    }

    pub fn forward(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forward {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn transfer(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage { .. }
                | Error::SessionClosed { .. }
                | Error::DeviceNotFound { .. }
                | Error::Protocol { .. }
                | Error::Adb { .. }
                | Error::TrackerStart { .. }
                | Error::Forward { .. }
                | Error::Transfer { .. }
                | Error::TransferCancelled // User chose to cancel
                | Error::ChannelSend { .. }
        )
    }

    /// Check if this error should trigger application exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Server { .. } | Error::AdbNotFound)
    }

    /// Whether this error is a user-initiated cancellation rather than a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::TransferCancelled)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
