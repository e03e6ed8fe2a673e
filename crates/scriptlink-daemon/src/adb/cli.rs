//! [`AdbBridge`] implementation backed by the `adb` binary

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use scriptlink_core::prelude::*;
use scriptlink_core::ForwardMapping;

use super::{AdbBridge, AdbDevice, TrackerChange};

/// Drives the `adb` command-line tool
#[derive(Debug, Clone)]
pub struct AdbCli {
    program: PathBuf,
}

impl AdbCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find `adb`: explicit path, then `PATH`, then the Android SDK env vars
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            warn!("Configured adb path {} does not exist", path.display());
        }

        if let Ok(path) = which::which("adb") {
            return Ok(Self::new(path));
        }

        sdk_candidates()
            .into_iter()
            .find(|p| p.is_file())
            .map(Self::new)
            .ok_or(Error::AdbNotFound)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("adb {}", args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::adb(format!("failed to run adb: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::adb(format!(
                "adb {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_on(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        self.run(&full).await
    }
}

impl AdbBridge for AdbCli {
    async fn list_devices(&self) -> Result<Vec<AdbDevice>> {
        let stdout = self.run(&["devices"]).await?;
        Ok(parse_device_list(&stdout))
    }

    async fn track_devices(&self) -> Result<mpsc::Receiver<TrackerChange>> {
        let mut known = ready_serials(
            &self
                .list_devices()
                .await
                .map_err(|e| Error::tracker_start(e.to_string()))?,
        );

        let mut child = Command::new(&self.program)
            .arg("track-devices")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tracker_start(format!("failed to spawn adb track-devices: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tracker_start("adb track-devices has no stdout"))?;

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                let frame = tokio::select! {
                    _ = tx.closed() => break,
                    frame = read_frame(&mut reader) => frame,
                };

                let payload = match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        debug!("adb track-devices stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!("adb track-devices read error: {}", e);
                        break;
                    }
                };

                let current = ready_serials(&parse_device_list(&payload));
                for change in ready_changes(&known, &current) {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        self.run_on(serial, &["shell", command]).await
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.run_on(serial, &["push", local.as_ref(), remote])
            .await
            .map(|_| ())
    }

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()> {
        let local = format!("tcp:{local_port}");
        let remote = format!("tcp:{remote_port}");
        self.run_on(serial, &["forward", &local, &remote])
            .await
            .map(|_| ())
    }

    async fn list_forwards(&self, serial: &str) -> Result<Vec<ForwardMapping>> {
        let stdout = self.run(&["forward", "--list"]).await?;
        Ok(parse_forward_list(&stdout)
            .into_iter()
            .filter(|f| f.device_id == serial)
            .collect())
    }

    async fn wait_for_device(&self, serial: &str) -> Result<()> {
        self.run_on(serial, &["wait-for-device"]).await.map(|_| ())
    }
}

/// Serials in the `device` state
fn ready_serials(devices: &[AdbDevice]) -> HashSet<String> {
    devices
        .iter()
        .filter(|d| d.is_ready())
        .map(|d| d.serial.clone())
        .collect()
}

/// Changes between two sets of ready serials
///
/// A device that becomes ready (e.g. once authorized) counts as added; one
/// that drops out of `device` state counts as removed.
fn ready_changes(known: &HashSet<String>, current: &HashSet<String>) -> Vec<TrackerChange> {
    let mut added: Vec<_> = current.difference(known).cloned().collect();
    let mut removed: Vec<_> = known.difference(current).cloned().collect();
    added.sort();
    removed.sort();
    added
        .into_iter()
        .map(TrackerChange::Added)
        .chain(removed.into_iter().map(TrackerChange::Removed))
        .collect()
}

/// SDK locations tried after `PATH`
fn sdk_candidates() -> Vec<PathBuf> {
    let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(|root| PathBuf::from(root).join("platform-tools").join(exe))
        .collect()
}

/// `<serial>  <state>` lines of `adb devices`
static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\S+)\s+(device|offline|unauthorized|recovery|sideload|bootloader|authorizing|connecting|no permissions|host)\b",
    )
    .expect("Invalid device line regex")
});

/// Parse `adb devices` output (also the payload of a track-devices frame)
pub(crate) fn parse_device_list(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let caps = DEVICE_LINE.captures(line.trim_end())?;
            Some(AdbDevice::new(&caps[1], &caps[2]))
        })
        .collect()
}

/// Parse `adb forward --list`, keeping tcp-to-tcp forwards only
pub(crate) fn parse_forward_list(output: &str) -> Vec<ForwardMapping> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let local = parts.next()?.strip_prefix("tcp:")?.parse().ok()?;
            let remote = parts.next()?.strip_prefix("tcp:")?.parse().ok()?;
            Some(ForwardMapping::new(serial, local, remote))
        })
        .collect()
}

/// Read one length-prefixed track-devices frame; `None` at end of stream
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = std::str::from_utf8(&len_buf)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad frame length {:?}", String::from_utf8_lossy(&len_buf)),
            )
        })?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "List of devices attached\n\
                      emulator-5554\tdevice\n\
                      R58M12ABCDE\tunauthorized\n\
                      \n";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], AdbDevice::new("emulator-5554", "device"));
        assert!(devices[0].is_ready());
        assert!(!devices[1].is_ready());
    }

    #[test]
    fn test_parse_device_list_skips_daemon_banner() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      192.168.1.9:5555\tdevice\n";
        let devices = parse_device_list(output);
        assert_eq!(devices, vec![AdbDevice::new("192.168.1.9:5555", "device")]);
    }

    #[test]
    fn test_parse_forward_list() {
        let output = "emulator-5554 tcp:9317 tcp:9317\n\
                      emulator-5554 tcp:8000 localabstract:foo\n\
                      R58M12ABCDE tcp:9318 tcp:9317\n";
        let forwards = parse_forward_list(output);
        assert_eq!(
            forwards,
            vec![
                ForwardMapping::new("emulator-5554", 9317, 9317),
                ForwardMapping::new("R58M12ABCDE", 9318, 9317),
            ]
        );
    }

    #[test]
    fn test_unauthorized_device_is_added_once_authorized() {
        let known = ready_serials(&parse_device_list("List of devices attached\nR58M\tunauthorized\n"));
        assert!(known.is_empty());

        let still = ready_serials(&parse_device_list("R58M\tunauthorized\n"));
        assert!(ready_changes(&known, &still).is_empty());

        let authorized = ready_serials(&parse_device_list("R58M\tdevice\n"));
        assert_eq!(
            ready_changes(&still, &authorized),
            vec![TrackerChange::Added("R58M".into())]
        );
    }

    #[test]
    fn test_device_going_offline_is_removed() {
        let known = ready_serials(&parse_device_list("R58M\tdevice\nemulator-5554\tdevice\n"));
        let current = ready_serials(&parse_device_list("R58M\toffline\nemulator-5554\tdevice\n"));
        assert_eq!(
            ready_changes(&known, &current),
            vec![TrackerChange::Removed("R58M".into())]
        );
    }

    #[tokio::test]
    async fn test_read_frame() {
        let data: &[u8] = b"0015emulator-5554\tdevice\n0000";
        let mut reader = data;
        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, "emulator-5554\tdevice\n");
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(second, "");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_length() {
        let data: &[u8] = b"zzzzpayload";
        let mut reader = data;
        tokio_test::assert_err!(read_frame(&mut reader).await);
    }

    #[test]
    fn test_sdk_candidates_use_env() {
        std::env::set_var("ANDROID_SDK_ROOT", "/test/sdk");
        let paths = sdk_candidates();
        assert!(paths
            .iter()
            .any(|p| p.starts_with("/test/sdk/platform-tools")));
        std::env::remove_var("ANDROID_SDK_ROOT");
    }
}
