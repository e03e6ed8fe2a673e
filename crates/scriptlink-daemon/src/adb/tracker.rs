//! ADB device lifecycle tracker
//!
//! Wraps one device-tracking subscription and turns it into [`TrackerEvent`]s.
//! At most one subscription is active; `start` while tracking reports
//! [`TrackerEvent::AlreadyRunning`] instead of subscribing again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};

use scriptlink_core::prelude::*;
use scriptlink_core::TrackerState;

use super::{AdbBridge, TrackerChange};

/// Events published by [`AdbTracker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Device already connected when tracking started
    Present(String),
    /// New device, ready for debug-bridge commands
    DeviceAdded(String),
    DeviceRemoved(String),
    TrackingStarted,
    AlreadyRunning,
    TrackingStopped,
    TrackingFailed(String),
}

struct TrackerInner {
    state: TrackerState,
    /// Bumped on every start/stop so a stale loop cannot touch newer state
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

pub struct AdbTracker<B> {
    bridge: Arc<B>,
    event_tx: mpsc::UnboundedSender<TrackerEvent>,
    inner: Arc<Mutex<TrackerInner>>,
}

impl<B> AdbTracker<B>
where
    B: AdbBridge + Sync + 'static,
{
    pub fn new(bridge: Arc<B>, event_tx: mpsc::UnboundedSender<TrackerEvent>) -> Self {
        Self {
            bridge,
            event_tx,
            inner: Arc::new(Mutex::new(TrackerInner {
                state: TrackerState::Idle,
                generation: 0,
                stop_tx: None,
            })),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Enumerate present devices, then subscribe to changes
    ///
    /// # Errors
    ///
    /// [`Error::TrackerStart`] when enumeration or subscription fails. The
    /// tracker is left in [`TrackerState::Error`] and can be started again.
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state == TrackerState::Tracking {
                drop(inner);
                debug!("ADB tracking already running");
                self.emit(TrackerEvent::AlreadyRunning);
                return Ok(());
            }
            inner.state = TrackerState::Tracking;
            inner.generation += 1;
            inner.generation
        };

        let changes = match self.subscribe().await {
            Ok(changes) => changes,
            Err(e) => {
                let message = e.to_string();
                {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    if inner.generation == generation {
                        inner.state = TrackerState::Error;
                    }
                }
                warn!("ADB tracking failed to start: {}", message);
                self.emit(TrackerEvent::TrackingFailed(message.clone()));
                return Err(Error::tracker_start(message));
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.generation != generation {
                // stopped while we were subscribing
                return Ok(());
            }
            inner.stop_tx = Some(stop_tx);
        }

        info!("ADB tracking started");
        self.emit(TrackerEvent::TrackingStarted);

        tokio::spawn(run_tracking(
            Arc::clone(&self.bridge),
            changes,
            stop_rx,
            self.event_tx.clone(),
            Arc::clone(&self.inner),
            generation,
        ));

        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<TrackerChange>> {
        let devices = self.bridge.list_devices().await?;
        for device in devices.into_iter().filter(|d| d.is_ready()) {
            self.emit(TrackerEvent::Present(device.serial));
        }
        self.bridge.track_devices().await
    }

    /// Stop tracking; safe to call in any state
    pub fn stop(&self) {
        let was_tracking = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = inner.stop_tx.take() {
                let _ = tx.send(());
            }
            let was_tracking = inner.state == TrackerState::Tracking;
            inner.state = TrackerState::Idle;
            inner.generation += 1;
            was_tracking
        };

        if was_tracking {
            info!("ADB tracking stopped");
            self.emit(TrackerEvent::TrackingStopped);
        }
    }
}

async fn run_tracking<B>(
    bridge: Arc<B>,
    mut changes: mpsc::Receiver<TrackerChange>,
    mut stop_rx: oneshot::Receiver<()>,
    event_tx: mpsc::UnboundedSender<TrackerEvent>,
    inner: Arc<Mutex<TrackerInner>>,
    generation: u64,
) where
    B: AdbBridge + Sync + 'static,
{
    let mut pending: JoinSet<(String, Result<()>)> = JoinSet::new();
    let mut waits: HashMap<String, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("ADB tracking loop stopped");
                break;
            }

            change = changes.recv() => match change {
                Some(TrackerChange::Added(serial)) => {
                    debug!("ADB device added: {}, waiting until ready", serial);
                    if let Some(previous) = waits.remove(&serial) {
                        previous.abort();
                    }
                    let bridge = Arc::clone(&bridge);
                    let id = serial.clone();
                    let handle = pending.spawn(async move {
                        let result = bridge.wait_for_device(&id).await;
                        (id, result)
                    });
                    waits.insert(serial, handle);
                }
                Some(TrackerChange::Removed(serial)) => {
                    debug!("ADB device removed: {}", serial);
                    if let Some(wait) = waits.remove(&serial) {
                        wait.abort();
                    }
                    let _ = event_tx.send(TrackerEvent::DeviceRemoved(serial));
                }
                None => {
                    let current = {
                        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                        if inner.generation == generation {
                            inner.state = TrackerState::Idle;
                            inner.stop_tx = None;
                            true
                        } else {
                            false
                        }
                    };
                    if current {
                        info!("ADB tracking ended");
                        let _ = event_tx.send(TrackerEvent::TrackingStopped);
                    }
                    break;
                }
            },

            Some(joined) = pending.join_next_with_id(), if !pending.is_empty() => match joined {
                Ok((task, (serial, result))) => {
                    // a removal or a newer add since this wait began supersedes it
                    if waits.get(&serial).map(AbortHandle::id) != Some(task) {
                        debug!("Dropping stale readiness result for {}", serial);
                        continue;
                    }
                    waits.remove(&serial);
                    match result {
                        Ok(()) => {
                            let _ = event_tx.send(TrackerEvent::DeviceAdded(serial));
                        }
                        Err(e) => warn!("Device {} never became ready: {}", serial, e),
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    let task = e.id();
                    waits.retain(|_, wait| wait.id() != task);
                    warn!("wait-for-device task failed: {}", e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{AdbCall, FakeAdb};
    use std::time::Duration;

    fn tracker(fake: &Arc<FakeAdb>) -> (AdbTracker<FakeAdb>, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AdbTracker::new(fake.clone(), tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TrackerEvent>) -> TrackerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for tracker event")
            .expect("tracker event channel closed")
    }

    #[tokio::test]
    async fn test_start_reports_present_devices() {
        let fake = Arc::new(FakeAdb::with_devices(&[
            ("emulator-5554", "device"),
            ("R58M", "unauthorized"),
        ]));
        let (tracker, mut rx) = tracker(&fake);

        tracker.start().await.unwrap();

        assert_eq!(next_event(&mut rx).await, TrackerEvent::Present("emulator-5554".into()));
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);
        assert_eq!(tracker.state(), TrackerState::Tracking);
    }

    #[tokio::test]
    async fn test_second_start_is_already_running() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);

        tracker.start().await.unwrap();
        tracker.start().await.unwrap();

        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);
        assert_eq!(next_event(&mut rx).await, TrackerEvent::AlreadyRunning);
        assert_eq!(fake.track_count(), 1);
    }

    #[tokio::test]
    async fn test_added_device_waits_until_ready() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        fake.hold_wait("emulator-5556");
        fake.emit(TrackerChange::Added("emulator-5556".into())).await;

        let early = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err(), "device reported before it was ready");

        fake.release_wait("emulator-5556");
        assert_eq!(
            next_event(&mut rx).await,
            TrackerEvent::DeviceAdded("emulator-5556".into())
        );
    }

    #[tokio::test]
    async fn test_removed_device_reported_immediately() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        fake.hold_wait("R58M");
        fake.emit(TrackerChange::Added("R58M".into())).await;
        fake.emit(TrackerChange::Removed("R58M".into())).await;

        assert_eq!(next_event(&mut rx).await, TrackerEvent::DeviceRemoved("R58M".into()));

        // the pending readiness wait was abandoned
        fake.release_wait("R58M");
        let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(late.is_err());
    }

    async fn wait_started(fake: &FakeAdb, serial: &str, count: usize) {
        let call = AdbCall::WaitForDevice {
            serial: serial.to_string(),
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while fake.calls().iter().filter(|c| **c == call).count() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("readiness wait never started");
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<TrackerEvent>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_add_after_remove_when_wait_already_finished() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        for n in 0..40 {
            let serial = format!("dev{n}");
            fake.hold_wait(&serial);
            fake.emit(TrackerChange::Added(serial.clone())).await;
            wait_started(&fake, &serial, 1).await;
            fake.release_wait(&serial);
            fake.emit(TrackerChange::Removed(serial)).await;
        }

        let events = drain(&mut rx).await;
        for n in 0..40 {
            let serial = format!("dev{n}");
            let removed = events
                .iter()
                .position(|e| *e == TrackerEvent::DeviceRemoved(serial.clone()))
                .expect("removal reported");
            assert!(
                !events[removed..].contains(&TrackerEvent::DeviceAdded(serial.clone())),
                "{serial} added after its removal: {events:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_repeated_add_reports_device_once() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        fake.hold_wait("R58M");
        fake.emit(TrackerChange::Added("R58M".into())).await;
        wait_started(&fake, "R58M", 1).await;
        fake.emit(TrackerChange::Added("R58M".into())).await;
        wait_started(&fake, "R58M", 2).await;
        fake.release_wait("R58M");

        assert_eq!(drain(&mut rx).await, vec![TrackerEvent::DeviceAdded("R58M".into())]);
    }

    #[tokio::test]
    async fn test_add_remove_add_reports_final_add() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        fake.hold_wait("R58M");
        fake.emit(TrackerChange::Added("R58M".into())).await;
        wait_started(&fake, "R58M", 1).await;
        fake.emit(TrackerChange::Removed("R58M".into())).await;
        fake.emit(TrackerChange::Added("R58M".into())).await;
        wait_started(&fake, "R58M", 2).await;
        fake.release_wait("R58M");

        assert_eq!(
            drain(&mut rx).await,
            vec![
                TrackerEvent::DeviceRemoved("R58M".into()),
                TrackerEvent::DeviceAdded("R58M".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_failure_leaves_tracker_restartable() {
        let fake = Arc::new(FakeAdb::new());
        fake.fail_track(Some("cannot connect to daemon"));
        let (tracker, mut rx) = tracker(&fake);

        let err = tracker.start().await.unwrap_err();
        assert!(matches!(err, Error::TrackerStart { .. }));
        assert!(matches!(next_event(&mut rx).await, TrackerEvent::TrackingFailed(m) if m.contains("cannot connect")));
        assert_eq!(tracker.state(), TrackerState::Error);

        fake.fail_track(None);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);
        assert_eq!(tracker.state(), TrackerState::Tracking);
    }

    #[tokio::test]
    async fn test_subscription_end_returns_to_idle() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        fake.end_tracking();

        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStopped);
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fake = Arc::new(FakeAdb::new());
        let (tracker, mut rx) = tracker(&fake);
        tracker.stop();
        tracker.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStarted);

        tracker.stop();
        tracker.stop();

        assert_eq!(next_event(&mut rx).await, TrackerEvent::TrackingStopped);
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }
}
