//! Headless runner - serve devices and take commands from stdin
//!
//! Starts the listener (and ADB tracking when available), prints every
//! [`ServerEvent`](scriptlink_app::ServerEvent) as NDJSON, and executes one
//! command per stdin line until `quit`, end of input or Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scriptlink_app::commands::{self, path_from_arg};
use scriptlink_app::{AppContext, Settings};
use scriptlink_core::prelude::*;
use scriptlink_daemon::{AdbCli, ZipCommandPacker};

use super::{emit_server_event, DeviceEntry, HeadlessEvent};

type Context = AppContext<AdbCli, ZipCommandPacker>;

/// One line of stdin input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    Run(PathBuf),
    Rerun(PathBuf),
    RunOn { device: String, path: PathBuf },
    Stop(String),
    StopAll,
    /// Save a project folder to every device
    Save(PathBuf),
    SaveTo { device: String, folder: PathBuf },
    /// Send a folder as an arbitrary project command
    Project { command: String, folder: PathBuf },
    Connect(String),
    Disconnect(String),
    Devices,
    AdbDevices,
    Track,
    Untrack,
    Listen,
    StopServer,
    Quit,
}

/// Parse one stdin line
///
/// Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> std::result::Result<Option<StdinCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let arg = |name: &str| {
        if rest.is_empty() {
            Err(format!("{verb}: missing {name}"))
        } else {
            Ok(rest.to_string())
        }
    };
    let pair = |first: &str, second: &str| match rest.split_once(char::is_whitespace) {
        Some((a, b)) if !b.trim().is_empty() => Ok((a.to_string(), b.trim().to_string())),
        _ => Err(format!("{verb}: expected <{first}> <{second}>")),
    };

    let command = match verb {
        "run" => StdinCommand::Run(path_from_arg(&arg("path")?)),
        "rerun" => StdinCommand::Rerun(path_from_arg(&arg("path")?)),
        "run-on" => {
            let (device, path) = pair("device", "path")?;
            StdinCommand::RunOn {
                device,
                path: path_from_arg(&path),
            }
        }
        "stop" => StdinCommand::Stop(arg("id")?),
        "stop-all" => StdinCommand::StopAll,
        "save" => StdinCommand::Save(path_from_arg(&arg("folder")?)),
        "save-to" => {
            let (device, folder) = pair("device", "folder")?;
            StdinCommand::SaveTo {
                device,
                folder: path_from_arg(&folder),
            }
        }
        "project" => {
            let (command, folder) = pair("command", "folder")?;
            StdinCommand::Project {
                command,
                folder: path_from_arg(&folder),
            }
        }
        "connect" => StdinCommand::Connect(arg("serial")?),
        "disconnect" => StdinCommand::Disconnect(arg("id")?),
        "devices" => StdinCommand::Devices,
        "adb-devices" => StdinCommand::AdbDevices,
        "track" => StdinCommand::Track,
        "untrack" => StdinCommand::Untrack,
        "listen" => StdinCommand::Listen,
        "stop-server" => StdinCommand::StopServer,
        "q" | "quit" => StdinCommand::Quit,
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(Some(command))
}

/// Run the bridge until quit
///
/// With `use_adb` false, or when no `adb` binary can be found, only directly
/// connecting devices are served. An explicitly configured `adb` path that
/// cannot be used is fatal.
pub async fn run_headless(settings: Settings, use_adb: bool) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("scriptlink starting in HEADLESS mode");
    info!("Listening address: {}", settings.server.addr());
    info!("═══════════════════════════════════════════════════════");

    let adb = if use_adb {
        match AdbCli::locate(settings.adb.path.as_deref()) {
            Ok(cli) => {
                info!("Using adb at {}", cli.program().display());
                Some(Arc::new(cli))
            }
            Err(e) if settings.adb.path.is_some() => return Err(e),
            Err(e) => {
                warn!("{}; continuing without ADB", e);
                HeadlessEvent::error(e.to_string(), false).emit();
                None
            }
        }
    } else {
        None
    };

    let packer = match ZipCommandPacker::locate(settings.transfer.zip_path.as_deref()) {
        Ok(packer) => packer,
        Err(e) => {
            warn!("{}", e);
            ZipCommandPacker::new("zip")
        }
    }
    .exclude(settings.transfer.temp_archive_name.clone());

    let auto_track = settings.adb.auto_track;
    let (context, sources) = Context::new(settings, adb, packer);
    let events_task = tokio::spawn(print_events(context.subscribe()));
    let loop_task = tokio::spawn(Arc::clone(&context).run(sources));

    let started = if auto_track {
        context.start_all().await
    } else {
        context.listen().await
    };
    let addr = match started {
        Ok(addr) => addr,
        Err(e) => {
            HeadlessEvent::error(e.to_string(), true).emit();
            context.shutdown();
            let _ = loop_task.await;
            return Err(e);
        }
    };
    HeadlessEvent::ready(addr, Context::server_addresses()).emit();

    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || spawn_stdin_reader_blocking(stdin_tx));

    let transfers = CancellationToken::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin_rx.recv() => {
                let Some(command) = line else {
                    info!("Stdin closed");
                    break;
                };
                if command == StdinCommand::Quit {
                    info!("Stdin: quit requested");
                    break;
                }
                let context = Arc::clone(&context);
                let cancel = transfers.child_token();
                tokio::spawn(async move {
                    if let Err(e) = execute(&context, command, cancel).await {
                        HeadlessEvent::error(e.to_string(), false).emit();
                    }
                });
            }
        }
    }

    transfers.cancel();
    context.stop_all().await;
    context.shutdown();
    let _ = loop_task.await;
    events_task.abort();

    info!("scriptlink headless mode exiting");
    Ok(())
}

async fn execute(context: &Arc<Context>, command: StdinCommand, cancel: CancellationToken) -> Result<()> {
    match command {
        StdinCommand::Run(path) => {
            let report = commands::run_file(context, &path).await?;
            HeadlessEvent::command_result("run", report).emit();
        }
        StdinCommand::Rerun(path) => {
            let report = commands::rerun_file(context, &path).await?;
            HeadlessEvent::command_result("rerun", report).emit();
        }
        StdinCommand::RunOn { device, path } => {
            commands::run_on(context, &device, &path).await?;
        }
        StdinCommand::Stop(id) => {
            let report = commands::stop(context, &id).await;
            HeadlessEvent::command_result("stop", report).emit();
        }
        StdinCommand::StopAll => {
            let report = commands::stop_all(context).await;
            HeadlessEvent::command_result("stopAll", report).emit();
        }
        StdinCommand::Save(folder) => {
            let report = commands::save_to_all(context, &folder).await;
            HeadlessEvent::command_result("save", report).emit();
        }
        StdinCommand::SaveTo { device, folder } => {
            context.save_project(&device, &folder, cancel).await?;
        }
        StdinCommand::Project { command, folder } => {
            let report = context.send_project_command(&folder, &command).await;
            HeadlessEvent::command_result(&command, report).emit();
        }
        StdinCommand::Connect(serial) => {
            context.connect_device(&serial).await?;
        }
        StdinCommand::Disconnect(id) => {
            context.disconnect_device(&id).await?;
        }
        StdinCommand::Devices => {
            let devices = context
                .devices_for_picker()
                .iter()
                .map(|s| DeviceEntry {
                    id: s.id(),
                    label: s.label(),
                })
                .collect();
            HeadlessEvent::devices(devices).emit();
        }
        StdinCommand::AdbDevices => {
            HeadlessEvent::adb_devices(context.adb_device_labels().await?).emit();
        }
        StdinCommand::Track => context.start_tracking().await?,
        StdinCommand::Untrack => context.stop_tracking(),
        StdinCommand::Listen => {
            context.listen().await?;
        }
        StdinCommand::StopServer => context.stop_server().await,
        StdinCommand::Quit => {}
    }
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<scriptlink_app::ServerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => emit_server_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Dropped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read stdin lines on a blocking thread and forward parsed commands
fn spawn_stdin_reader_blocking(tx: mpsc::UnboundedSender<StdinCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => match parse_command(&line) {
                Ok(Some(command)) => {
                    let quit = command == StdinCommand::Quit;
                    if tx.send(command).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => {
                    warn!("{}", message);
                    HeadlessEvent::error(message, false).emit();
                }
            },
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
    info!("Stdin reader exiting");
}
