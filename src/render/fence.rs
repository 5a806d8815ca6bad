//! Fence synchronization for rendered content.
//!
//! A [`FenceSync`] tracks one render: it is started right after the render's
//! commands are submitted and polled until the GPU reports completion. The
//! underlying fence is released when the sync is cleared or dropped.

use crate::core::time::Time;
use crate::render::backend::{FenceStatus, GpuFence};

#[derive(Default)]
pub struct FenceSync {
    fence: Option<Box<dyn GpuFence>>,
    start_time: Option<Time>,
    complete_time: Option<Time>,
    failed: bool,
}

impl FenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking `fence`, replacing any previous one.
    pub fn start_sync(&mut self, fence: Box<dyn GpuFence>, now: Time) {
        self.fence = Some(fence);
        self.start_time = Some(now);
        self.complete_time = None;
        self.failed = false;
    }

    /// Poll the fence. Returns true once the tracked work has completed.
    pub fn update_sync(&mut self) -> bool {
        if self.complete_time.is_some() {
            return true;
        }
        let Some(fence) = self.fence.as_mut() else {
            return false;
        };
        match fence.poll() {
            FenceStatus::Pending => false,
            FenceStatus::Signaled(at) => {
                self.complete_time = Some(at);
                self.fence = None;
                true
            }
            FenceStatus::Failed => {
                self.failed = true;
                self.fence = None;
                false
            }
        }
    }

    /// Whether a fence is being waited on.
    pub fn is_syncing(&self) -> bool {
        self.fence.is_some()
    }

    /// Whether the tracked work completed.
    pub fn sync_success(&self) -> bool {
        self.complete_time.is_some()
    }

    pub fn sync_failed(&self) -> bool {
        self.failed
    }

    pub fn start_time(&self) -> Option<Time> {
        self.start_time
    }

    pub fn complete_time(&self) -> Option<Time> {
        self.complete_time
    }

    /// Release the fence and forget all results.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl std::fmt::Debug for FenceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceSync")
            .field("syncing", &self.is_syncing())
            .field("start_time", &self.start_time)
            .field("complete_time", &self.complete_time)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedFence(VecDeque<FenceStatus>);

    impl GpuFence for ScriptedFence {
        fn poll(&mut self) -> FenceStatus {
            self.0.pop_front().unwrap_or(FenceStatus::Pending)
        }
    }

    fn scripted(statuses: &[FenceStatus]) -> Box<dyn GpuFence> {
        Box::new(ScriptedFence(statuses.iter().copied().collect()))
    }

    #[test]
    fn test_completes_after_pending() {
        let mut sync = FenceSync::new();
        assert!(!sync.update_sync());
        sync.start_sync(
            scripted(&[FenceStatus::Pending, FenceStatus::Signaled(Time::from_millis(5))]),
            Time::from_millis(1),
        );
        assert!(sync.is_syncing());
        assert!(!sync.update_sync());
        assert!(sync.update_sync());
        assert!(!sync.is_syncing());
        assert!(sync.sync_success());
        assert_eq!(sync.complete_time(), Some(Time::from_millis(5)));
        // stays complete
        assert!(sync.update_sync());
    }

    #[test]
    fn test_failure_and_clear() {
        let mut sync = FenceSync::new();
        sync.start_sync(scripted(&[FenceStatus::Failed]), Time::ZERO);
        assert!(!sync.update_sync());
        assert!(sync.sync_failed());
        assert!(!sync.sync_success());
        sync.clear();
        assert!(!sync.sync_failed());
        assert_eq!(sync.start_time(), None);
    }
}
