//! Live set of attached device sessions
//!
//! The registry is the only place that decides which sessions a broadcast
//! reaches. A session is present iff it has completed its handshake and has not
//! been detached. Each entry owns a [`DeviceLog`].

use std::collections::HashMap;
use std::sync::RwLock;

use futures_util::future::join_all;
use serde_json::{Map, Value};

use scriptlink_core::prelude::*;
use scriptlink_core::SessionState;
use scriptlink_daemon::SessionHandle;

use crate::device_log::DeviceLog;

/// Outcome of a fan-out send
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Ids of the sessions the send failed on
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionHandle>,
    logs: HashMap<String, DeviceLog>,
}

pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    log_capacity: usize,
}

impl SessionRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            log_capacity,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an attached session
    ///
    /// Returns the session previously registered under the same id, which the
    /// caller should close. Sessions that are not (or no longer) attached are
    /// refused.
    pub fn attach(&self, session: SessionHandle) -> Result<Option<SessionHandle>> {
        if session.state() != SessionState::Attached {
            return Err(Error::session_closed(session.label()));
        }

        let id = session.id();
        let log = DeviceLog::new(session.label(), self.log_capacity);
        let mut inner = self.write();
        inner.logs.insert(id.clone(), log);
        let replaced = inner.sessions.insert(id, session);
        Ok(replaced)
    }

    /// Remove the session `id` if it is still the given `instance`
    ///
    /// A disconnect from a session that was already replaced by a newer one
    /// with the same id leaves the newer one alone.
    pub fn detach(&self, id: &str, instance: u64) -> Option<SessionHandle> {
        let mut inner = self.write();
        let current = inner
            .sessions
            .get(id)
            .is_some_and(|s| s.instance() == instance);
        if !current {
            return None;
        }
        inner.logs.remove(id);
        inner.sessions.remove(id)
    }

    /// Remove every session and log sink
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut inner = self.write();
        inner.logs.clear();
        inner.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.read().sessions.get(id).cloned()
    }

    pub fn lookup(&self, id: &str) -> Result<SessionHandle> {
        self.get(id).ok_or_else(|| Error::device_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Attached sessions, oldest first
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<_> = self.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| (s.attached_at(), s.instance()));
        sessions
    }

    // ─────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────

    pub async fn broadcast(&self, kind: &str, data: Value) -> BroadcastReport {
        let sessions = self.sessions();
        let results = join_all(sessions.iter().map(|s| s.send(kind, data.clone()))).await;
        report(&sessions, results)
    }

    pub async fn broadcast_command(&self, command: &str, data: Map<String, Value>) -> BroadcastReport {
        let sessions = self.sessions();
        let results =
            join_all(sessions.iter().map(|s| s.send_command(command, data.clone()))).await;
        report(&sessions, results)
    }

    pub async fn broadcast_bytes(&self, bytes: &[u8]) -> BroadcastReport {
        let sessions = self.sessions();
        let results = join_all(sessions.iter().map(|s| s.send_bytes(bytes.to_vec()))).await;
        report(&sessions, results)
    }

    pub async fn broadcast_bytes_command(
        &self,
        command: &str,
        content_hash: &str,
        extra: Map<String, Value>,
    ) -> BroadcastReport {
        let sessions = self.sessions();
        let results = join_all(
            sessions
                .iter()
                .map(|s| s.send_bytes_command(command, content_hash, extra.clone())),
        )
        .await;
        report(&sessions, results)
    }

    // ─────────────────────────────────────────────────────────
    // Device logs
    // ─────────────────────────────────────────────────────────

    /// Append a line logged by session `instance`
    ///
    /// Returns `false` if that session is not the one registered under `id`.
    pub fn route_log(&self, id: &str, instance: u64, line: &str) -> bool {
        let mut inner = self.write();
        let current = inner
            .sessions
            .get(id)
            .is_some_and(|s| s.instance() == instance);
        if !current {
            return false;
        }
        match inner.logs.get_mut(id) {
            Some(log) => {
                log.append(line);
                true
            }
            None => false,
        }
    }

    /// Append a host-side line to the log of device `id`
    pub fn append_log(&self, id: &str, line: impl Into<String>) -> bool {
        match self.write().logs.get_mut(id) {
            Some(log) => {
                log.append(line);
                true
            }
            None => false,
        }
    }

    pub fn log_lines(&self, id: &str) -> Option<Vec<String>> {
        self.read().logs.get(id).map(DeviceLog::lines)
    }
}

fn report(sessions: &[SessionHandle], results: Vec<Result<()>>) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for (session, result) in sessions.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!("Send to {} failed: {}", session.label(), e);
                report.failed.push(session.id());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{attached_session, closed_session};
    use scriptlink_core::DeviceIdentity;
    use scriptlink_daemon::test_utils::next_json;
    use scriptlink_daemon::SessionEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_attach_and_lookup() {
        let registry = SessionRegistry::new(10);
        let device = attached_session(DeviceIdentity::adb("R58M"), "Pixel").await;

        assert!(registry.attach(device.handle.clone()).unwrap().is_none());

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup("R58M").unwrap().instance(), device.handle.instance());
        assert!(matches!(
            registry.lookup("missing"),
            Err(Error::DeviceNotFound { .. })
        ));
        assert_eq!(
            registry.log_lines("R58M").unwrap(),
            vec!["Device connected: Device Pixel(adb: R58M)"]
        );
    }

    #[tokio::test]
    async fn test_closed_session_is_refused() {
        let registry = SessionRegistry::new(10);
        let (handle, _client) = closed_session(DeviceIdentity::adb("R58M")).await;

        assert!(registry.attach(handle).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_detach_ignores_stale_instance() {
        let registry = SessionRegistry::new(10);
        let first = attached_session(DeviceIdentity::adb("R58M"), "Pixel").await;
        let second = attached_session(DeviceIdentity::adb("R58M"), "Pixel").await;

        registry.attach(first.handle.clone()).unwrap();
        let replaced = registry.attach(second.handle.clone()).unwrap();
        assert_eq!(replaced.unwrap().instance(), first.handle.instance());

        assert!(registry.detach("R58M", first.handle.instance()).is_none());
        assert!(registry.contains("R58M"));

        assert!(registry.detach("R58M", second.handle.instance()).is_some());
        assert!(registry.is_empty());
        assert!(registry.log_lines("R58M").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let registry = SessionRegistry::new(10);
        let mut a = attached_session(DeviceIdentity::adb("A"), "A").await;
        let mut b = attached_session(DeviceIdentity::adb("B"), "B").await;
        let mut dead = attached_session(DeviceIdentity::adb("C"), "C").await;
        registry.attach(a.handle.clone()).unwrap();
        registry.attach(b.handle.clone()).unwrap();
        registry.attach(dead.handle.clone()).unwrap();

        drop(dead.client);
        assert!(matches!(
            dead.events.recv().await,
            Some(SessionEvent::Disconnected { .. })
        ));

        let mut data = Map::new();
        data.insert("id".into(), json!("main.js"));
        let report = registry.broadcast_command("stop", data).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec!["C".to_string()]);
        for client in [&mut a.client, &mut b.client] {
            let frame = next_json(client).await.unwrap();
            assert_eq!(frame["data"]["command"], "stop");
            assert_eq!(frame["data"]["id"], "main.js");
        }
    }

    #[tokio::test]
    async fn test_route_log_only_for_current_instance() {
        let registry = SessionRegistry::new(10);
        let device = attached_session(DeviceIdentity::adb("R58M"), "Pixel").await;
        registry.attach(device.handle.clone()).unwrap();

        assert!(registry.route_log("R58M", device.handle.instance(), "hello"));
        assert!(!registry.route_log("R58M", device.handle.instance() + 1000, "stale"));
        assert!(!registry.route_log("other", 1, "nobody"));

        let lines = registry.log_lines("R58M").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "hello");
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = SessionRegistry::new(10);
        let a = attached_session(DeviceIdentity::adb("A"), "A").await;
        registry.attach(a.handle.clone()).unwrap();

        let drained = registry.drain();

        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.log_lines("A").is_none());
    }
}
