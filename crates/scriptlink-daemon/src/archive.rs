//! Project packing through the external `zip` tool

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use scriptlink_core::prelude::*;
use scriptlink_core::{ProjectDiff, ProjectPacker, ProjectWatch};

/// Packs a whole project folder into a zip archive on every diff
#[derive(Debug, Clone)]
pub struct ZipCommandPacker {
    program: PathBuf,
    exclude: Vec<String>,
}

impl ZipCommandPacker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            exclude: Vec::new(),
        }
    }

    /// Use `explicit` if given, otherwise find `zip` on `PATH`
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Ok(Self::new(path)),
            None => which::which("zip")
                .map(Self::new)
                .map_err(|_| Error::config("zip not found in PATH; set [transfer] zip_path")),
        }
    }

    /// Leave files matching `pattern` out of every archive
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }
}

impl ProjectPacker for ZipCommandPacker {
    type Watch = ZipWatch;

    fn watch(&self, folder: &Path) -> ZipWatch {
        ZipWatch {
            program: self.program.clone(),
            folder: folder.to_path_buf(),
            exclude: self.exclude.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ZipWatch {
    program: PathBuf,
    folder: PathBuf,
    exclude: Vec<String>,
}

impl ProjectWatch for ZipWatch {
    fn folder(&self) -> &Path {
        &self.folder
    }

    async fn diff(&mut self) -> Result<ProjectDiff> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.folder)
            .args(["-q", "-r", "-X", "-", "."])
            .stdin(Stdio::null());
        if !self.exclude.is_empty() {
            cmd.arg("-x");
            for pattern in &self.exclude {
                cmd.arg(pattern).arg(format!("*/{pattern}"));
            }
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Io(std::io::Error::other(format!(
                "zip failed for {}: {}",
                self.folder.display(),
                stderr.trim()
            ))));
        }

        debug!(
            "Packed {} ({} bytes)",
            self.folder.display(),
            output.stdout.len()
        );
        Ok(ProjectDiff::from_bytes(output.stdout))
    }
}
