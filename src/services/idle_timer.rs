//! Idle auto-close countdown
//!
//! Owned by the controller and only touched under its lock. Each arm bumps
//! an epoch so an expiry that was already racing for the lock when the
//! countdown got re-armed or cancelled can be recognized as stale.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub(crate) struct IdleTimer {
    duration: Option<Duration>,
    epoch: u64,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    /// `None` disables the countdown entirely
    pub(crate) fn new(duration: Option<Duration>) -> Self {
        Self { duration, epoch: 0, handle: None }
    }

    /// (Re)start the countdown; `on_expire` receives the epoch it was armed with
    pub(crate) fn arm<F>(&mut self, runtime: &Handle, on_expire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.disarm();
        let Some(duration) = self.duration else { return };

        let epoch = self.epoch;
        self.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            on_expire(epoch);
        }));
    }

    /// Cancel any pending countdown
    pub(crate) fn disarm(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `epoch` belongs to the countdown that is armed right now
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.handle.is_some() && self.epoch == epoch
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.duration
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
