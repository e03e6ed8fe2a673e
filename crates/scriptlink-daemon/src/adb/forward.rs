//! Idempotent host-to-device TCP forward allocation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use scriptlink_core::prelude::*;
use scriptlink_core::ForwardMapping;

use super::AdbBridge;

/// Ensures a single `tcp:local -> tcp:remote` forward exists per device and
/// remote port
///
/// Check-then-create is serialized per device so two concurrent requests for
/// the same device cannot both create a forward.
pub struct ForwardAllocator<B> {
    bridge: Arc<B>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<B: AdbBridge + Sync> ForwardAllocator<B> {
    pub fn new(bridge: Arc<B>) -> Self {
        Self {
            bridge,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn device_lock(&self, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(device.to_string()).or_default().clone()
    }

    /// Return the forward for `device`/`remote_port`, creating it on
    /// `local_port` if none exists
    ///
    /// An existing forward is reused as-is, so the returned `local_port` may
    /// differ from the requested one.
    pub async fn ensure_forward(
        &self,
        device: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardMapping> {
        let lock = self.device_lock(device);
        let _guard = lock.lock().await;

        let existing = self
            .bridge
            .list_forwards(device)
            .await
            .map_err(|e| Error::forward(device, e.to_string()))?;

        if let Some(mapping) = existing.into_iter().find(|f| f.remote_port == remote_port) {
            debug!(
                "Reusing forward tcp:{} -> tcp:{} for {}",
                mapping.local_port, mapping.remote_port, device
            );
            return Ok(mapping);
        }

        self.bridge
            .forward(device, local_port, remote_port)
            .await
            .map_err(|e| Error::forward(device, e.to_string()))?;

        info!(
            "Forwarded tcp:{} -> tcp:{} for {}",
            local_port, remote_port, device
        );
        Ok(ForwardMapping::new(device, local_port, remote_port))
    }

    /// Drop the serialization lock of a device that went away
    pub fn forget(&self, device: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{AdbCall, FakeAdb};

    fn forward_calls(fake: &FakeAdb) -> usize {
        fake.calls()
            .iter()
            .filter(|c| matches!(c, AdbCall::Forward { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_ensure_forward_creates_once() {
        let fake = Arc::new(FakeAdb::new());
        let allocator = ForwardAllocator::new(fake.clone());

        let first = allocator.ensure_forward("emulator-5554", 9317, 9317).await.unwrap();
        let second = allocator.ensure_forward("emulator-5554", 9317, 9317).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(forward_calls(&fake), 1);
    }

    #[tokio::test]
    async fn test_ensure_forward_reuses_existing_local_port() {
        let fake = Arc::new(FakeAdb::new());
        fake.add_forward(ForwardMapping::new("emulator-5554", 12000, 9317));
        let allocator = ForwardAllocator::new(fake.clone());

        let mapping = allocator.ensure_forward("emulator-5554", 9317, 9317).await.unwrap();

        assert_eq!(mapping.local_port, 12000);
        assert_eq!(forward_calls(&fake), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_one_forward() {
        let fake = Arc::new(FakeAdb::new());
        let allocator = Arc::new(ForwardAllocator::new(fake.clone()));

        let a = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.ensure_forward("R58M", 9317, 9317).await })
        };
        let b = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.ensure_forward("R58M", 9317, 9317).await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(forward_calls(&fake), 1);
    }

    #[tokio::test]
    async fn test_forward_failure_surfaces_as_forward_error() {
        let fake = Arc::new(FakeAdb::new());
        fake.fail_forward("device offline");
        let allocator = ForwardAllocator::new(fake.clone());

        let err = allocator.ensure_forward("R58M", 9317, 9317).await.unwrap_err();
        match err {
            Error::Forward { device, message } => {
                assert_eq!(device, "R58M");
                assert!(message.contains("device offline"));
            }
            other => panic!("expected Forward error, got {other:?}"),
        }
    }
}
