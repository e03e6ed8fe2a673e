//! Logging configuration using tracing
//!
//! Two daily-rolling files: `scriptlink.log` for the bridge itself, filtered by
//! `SCRIPTLINK_LOG`, and `devices.log` holding only the lines devices send
//! (everything under [`DEVICE_LOG_TARGET`]). Device lines never reach the main
//! file.

use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{Directive, Targets};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::error::{Error, Result};

/// Tracing target used for log lines forwarded from devices
pub const DEVICE_LOG_TARGET: &str = "scriptlink::device";

const DEFAULT_DIRECTIVES: &str = "scriptlink=info,warn";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/scriptlink/logs/`
/// Log level of `scriptlink.log` is controlled by `SCRIPTLINK_LOG`.
///
/// # Examples
/// ```bash
/// SCRIPTLINK_LOG=debug scriptlink serve
/// SCRIPTLINK_LOG=scriptlink_daemon=trace,info scriptlink serve
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let app_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "scriptlink.log");
    let device_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "devices.log");

    // Fall back to the default on an unparsable SCRIPTLINK_LOG
    let directives = match std::env::var("SCRIPTLINK_LOG") {
        Ok(spec) if EnvFilter::try_new(&spec).is_ok() => spec,
        _ => DEFAULT_DIRECTIVES.to_string(),
    };

    tracing_subscriber::registry()
        .with(file_layers::<Registry, _, _>(app_appender, device_appender, &directives)?)
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("scriptlink starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// The main log layer and the device log layer, each with its own filter
fn file_layers<S, A, D>(app: A, devices: D, directives: &str) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    A: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    D: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let device_off: Directive = format!("{DEVICE_LOG_TARGET}=off")
        .parse()
        .map_err(|e| Error::config(format!("invalid log directive: {e}")))?;
    let app_filter = EnvFilter::try_new(directives)
        .map_err(|e| Error::config(format!("invalid SCRIPTLINK_LOG: {e}")))?
        .add_directive(device_off);

    let app_layer = fmt::layer()
        .with_writer(app)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_filter(app_filter);

    // device lines carry their own origin in the `device` field
    let device_layer = fmt::layer()
        .with_writer(devices)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_filter(device_filter());

    Ok(app_layer.and_then(device_layer))
}

fn device_filter() -> Targets {
    Targets::new().with_target(DEVICE_LOG_TARGET, LevelFilter::TRACE)
}

fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("scriptlink").join("logs")
}
