//! Project transfer orchestration
//!
//! A [`TransferJob`] delivers one packed project to one session. Tunneled
//! devices receive the archive through `adb push` and unpack it with a remote
//! shell; directly connected devices receive a binary frame followed by a
//! `save_project` bytes command.
//!
//! ```text
//! Preparing(0) ─▶ Packing(20) ─▶ Transmitting(40..80) ─▶ Saving(80) ─▶ Done(100)
//!      └──────────────┴───────────────┴────────────────────┴──▶ Cancelled | Failed
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scriptlink_core::prelude::*;
use scriptlink_core::{ProjectDiff, ProjectWatch};
use scriptlink_daemon::{AdbBridge, AdbHandle, SessionHandle};

use crate::config::TransferSettings;

/// Name of the archive inside the on-device staging directory
const REMOTE_ARCHIVE: &str = "temp.zip";

/// Command sent to directly connected devices after the project bytes
pub const SAVE_PROJECT_COMMAND: &str = "save_project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Preparing,
    Packing,
    Transmitting,
    Saving,
    Done,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Done | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }
}

/// One progress report
///
/// `percent` is the overall position; `increment` is the change since the
/// previous report, for progress sinks that accumulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub device: String,
    pub phase: TransferPhase,
    pub message: String,
    pub percent: u8,
    pub increment: u8,
}

/// Temporary archive that is removed however the job ends
struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

pub struct TransferJob<B> {
    session: SessionHandle,
    project_path: PathBuf,
    adb: Option<AdbHandle<B>>,
    staging_dir: String,
    temp_archive_name: String,
    cancel: CancellationToken,
    progress_percent: u8,
    progress_tx: Option<mpsc::UnboundedSender<TransferProgress>>,
}

impl<B: AdbBridge + Sync> TransferJob<B> {
    pub fn new(session: SessionHandle, project_path: impl Into<PathBuf>, settings: &TransferSettings) -> Self {
        Self {
            session,
            project_path: project_path.into(),
            adb: None,
            staging_dir: settings.staging_dir.clone(),
            temp_archive_name: settings.temp_archive_name.clone(),
            cancel: CancellationToken::new(),
            progress_percent: 0,
            progress_tx: None,
        }
    }

    /// Deliver through `adb push` instead of the session
    pub fn with_adb(mut self, adb: Option<AdbHandle<B>>) -> Self {
        self.adb = adb;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress_tx: mpsc::UnboundedSender<TransferProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the job to completion, packing through `watch`
    ///
    /// Resolves to [`Error::TransferCancelled`] if the token fires before the
    /// job finishes; no later step starts after that.
    pub async fn run<W: ProjectWatch>(mut self, watch: &mut W) -> Result<()> {
        let device = self.session.identity().short_name().to_string();
        let result = self.execute(watch).await;

        match &result {
            Ok(()) => self.report(TransferPhase::Done, "Project sent", 100),
            Err(e) if e.is_cancellation() => {
                info!("Transfer to {} cancelled", device);
                let percent = self.progress_percent;
                self.report(TransferPhase::Cancelled, "Cancelled", percent);
            }
            Err(e) => {
                error!("Transfer to {} failed: {}", device, e);
                let percent = self.progress_percent;
                self.report(TransferPhase::Failed, &e.to_string(), percent);
            }
        }

        result.map_err(|e| match e {
            Error::TransferCancelled | Error::Transfer { .. } => e,
            e => Error::transfer(device, e.to_string()),
        })
    }

    async fn execute<W: ProjectWatch>(&mut self, watch: &mut W) -> Result<()> {
        self.report(TransferPhase::Preparing, "Preparing project files", 0);
        let diff = self.guard(watch.diff()).await?;

        self.report(TransferPhase::Packing, "Packing project files", 20);
        self.check_cancelled()?;

        match self.adb.clone() {
            Some(adb) => self.send_via_adb(&adb, &diff).await,
            None => self.send_via_session(&diff).await,
        }
    }

    async fn send_via_adb(&mut self, adb: &AdbHandle<B>, diff: &ProjectDiff) -> Result<()> {
        self.report(TransferPhase::Transmitting, "Sending project over ADB", 40);

        let local = self.project_path.join(&self.temp_archive_name);
        let archive = TempArchive::new(local);
        // the write runs on the blocking pool and cannot be abandoned midway
        archive.write(&diff.buffer).await?;
        self.check_cancelled()?;

        let staging = shell_quote(&self.staging_dir);
        self.guard(adb.shell(&format!("mkdir -p {staging}"))).await?;

        self.report(TransferPhase::Transmitting, "Pushing archive", 60);
        let remote = format!("{}/{}", self.staging_dir.trim_end_matches('/'), REMOTE_ARCHIVE);
        self.guard(adb.push(&archive.path, &remote)).await?;

        self.report(TransferPhase::Saving, "Unpacking project", 80);
        self.guard(adb.shell(&format!(
            "cd {staging} && unzip -o {REMOTE_ARCHIVE} && rm {REMOTE_ARCHIVE}"
        )))
        .await?;

        drop(archive);
        Ok(())
    }

    async fn send_via_session(&mut self, diff: &ProjectDiff) -> Result<()> {
        self.report(TransferPhase::Transmitting, "Sending project over the socket", 40);
        self.guard(self.session.send_bytes(diff.buffer.clone())).await?;

        self.report(TransferPhase::Saving, "Saving project", 80);
        let extra = project_extra(&self.project_path);
        self.guard(
            self.session
                .send_bytes_command(SAVE_PROJECT_COMMAND, &diff.content_hash, extra),
        )
        .await
    }

    /// Await `step` unless the job is cancelled first
    async fn guard<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::TransferCancelled),
            result = step => result,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransferCancelled);
        }
        Ok(())
    }

    fn report(&mut self, phase: TransferPhase, message: &str, percent: u8) {
        let increment = percent.saturating_sub(self.progress_percent);
        self.progress_percent = self.progress_percent.max(percent);
        debug!("{}: {} ({}%)", self.session.label(), message, percent);

        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(TransferProgress {
                device: self.session.id(),
                phase,
                message: message.to_string(),
                percent,
                increment,
            });
        }
    }
}

/// `{id, name}` payload identifying a project folder
pub fn project_extra(folder: &Path) -> Map<String, serde_json::Value> {
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string());
    let mut extra = Map::new();
    extra.insert("id".into(), json!(folder.display().to_string()));
    extra.insert("name".into(), json!(name));
    extra
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
