//! Script and project commands sent to devices
//!
//! Thin helpers over [`AppContext`] that build the command payloads devices
//! expect, plus routing for `GET /exec` requests.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use scriptlink_core::prelude::*;
use scriptlink_core::ProjectPacker;
use scriptlink_daemon::{AdbBridge, ExecRequest};

use crate::context::AppContext;
use crate::registry::BroadcastReport;

/// `{id, name, script}` for the script at `path`
async fn script_payload(path: &Path) -> Result<Map<String, Value>> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path.display().to_string();

    let mut data = Map::new();
    data.insert("id".into(), json!(name));
    data.insert("name".into(), json!(name));
    data.insert("script".into(), json!(script));
    Ok(data)
}

/// Accept both plain paths and `file://` URLs
pub fn path_from_arg(arg: &str) -> PathBuf {
    PathBuf::from(arg.strip_prefix("file://").unwrap_or(arg))
}

/// Run the script at `path` on every attached device
pub async fn run_file<B, P>(context: &AppContext<B, P>, path: &Path) -> Result<BroadcastReport>
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let data = script_payload(path).await?;
    Ok(context.registry().broadcast_command("run", data).await)
}

/// Restart the script at `path` on every attached device
pub async fn rerun_file<B, P>(context: &AppContext<B, P>, path: &Path) -> Result<BroadcastReport>
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let data = script_payload(path).await?;
    Ok(context.registry().broadcast_command("rerun", data).await)
}

/// Run the script at `path` on one device and remember it for the picker
pub async fn run_on<B, P>(context: &AppContext<B, P>, device: &str, path: &Path) -> Result<()>
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let session = context.registry().lookup(device)?;
    context.set_recent_device(device);
    let data = script_payload(path).await?;
    session.send_command("run", data).await
}

/// Stop the script with `id` on every attached device
pub async fn stop<B, P>(context: &AppContext<B, P>, id: &str) -> BroadcastReport
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let mut data = Map::new();
    data.insert("id".into(), json!(id));
    context.registry().broadcast_command("stop", data).await
}

pub async fn stop_all<B, P>(context: &AppContext<B, P>) -> BroadcastReport
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    context.registry().broadcast_command("stopAll", Map::new()).await
}

/// Save `folder` to every attached device, one transfer job each
pub async fn save_to_all<B, P>(context: &AppContext<B, P>, folder: &Path) -> BroadcastReport
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let sessions = context.registry().sessions();
    let results = futures_util::future::join_all(
        sessions
            .iter()
            .map(|s| async move { context.save_project(&s.id(), folder, CancellationToken::new()).await }),
    )
    .await;

    let mut report = BroadcastReport::default();
    for (session, result) in sessions.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(_) => report.failed.push(session.id()),
        }
    }
    report
}

/// Route a `GET /exec` request
///
/// `save` saves the project at `path` to every device; `rerun` stops all
/// scripts, waits, then runs the file at `path`. Other commands are ignored.
pub async fn handle_exec<B, P>(context: &AppContext<B, P>, request: &ExecRequest) -> Result<()>
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    let path = path_from_arg(&request.path);
    match request.cmd.as_str() {
        "save" => {
            let report = save_to_all(context, &path).await;
            debug!("save {}: {:?}", path.display(), report);
        }
        "rerun" => {
            stop_all(context).await;
            tokio::time::sleep(context.settings().commands.rerun_delay()).await;
            run_file(context, &path).await?;
        }
        other => debug!("Ignoring /exec command {:?}", other),
    }
    Ok(())
}
