//! Virtual display driver seam and watchdog.
//!
//! The platform driver that instantiates synthetic monitors is an
//! external collaborator behind [`VirtualDisplayDriver`]. The host wraps
//! it with status tracking and a watchdog that pings the driver at a
//! third of its timeout; three consecutive failed pings mark the driver
//! failed and close the handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Consecutive ping failures tolerated before the driver is declared dead.
const WATCHDOG_MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Unknown,
    Ok,
    Failed,
    WatchdogFailed,
}

/// A display the driver should instantiate.
#[derive(Debug, Clone)]
pub struct VirtualDisplayRequest {
    /// Device identity; doubles as the removal GUID.
    pub device_uuid: Uuid,
    pub device_name: String,
    pub width: u32,
    pub height: u32,
    pub fps_milli: u32,
}

/// Platform virtual-display driver.
pub trait VirtualDisplayDriver: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self);
    /// Health probe; `false` counts toward the watchdog limit.
    fn ping(&self) -> bool;
    /// Instantiate a display, returning its name.
    fn create_display(&self, request: &VirtualDisplayRequest) -> Result<String>;
    /// Remove a display by GUID. Returns whether anything was removed.
    fn remove_display(&self, guid: &Uuid) -> bool;
    /// Apply a mode to a display the driver owns.
    fn change_mode(
        &self,
        display: &str,
        width: u32,
        height: u32,
        fps_milli: u32,
        isolated: bool,
    ) -> Result<()>;
    /// Current HDR state of a display, if known.
    fn hdr_state(&self, display: &str) -> Option<bool>;
    /// Toggle HDR. Returns whether the change took effect.
    fn set_hdr(&self, display: &str, enable: bool) -> bool;
}

/// Driver wrapper owning status and the watchdog task.
pub struct VirtualDisplayHost {
    driver: Arc<dyn VirtualDisplayDriver>,
    status: Mutex<DriverStatus>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    ping_timeout: Duration,
}

impl VirtualDisplayHost {
    pub fn new(driver: Arc<dyn VirtualDisplayDriver>, ping_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            driver,
            status: Mutex::new(DriverStatus::Unknown),
            watchdog: Mutex::new(None),
            ping_timeout,
        })
    }

    pub fn status(&self) -> DriverStatus {
        *self.status.lock().unwrap()
    }

    pub fn driver(&self) -> &Arc<dyn VirtualDisplayDriver> {
        &self.driver
    }

    /// Open the driver if it isn't already, starting the watchdog.
    pub fn ensure_open(self: &Arc<Self>) -> DriverStatus {
        {
            let status = self.status.lock().unwrap();
            if *status == DriverStatus::Ok {
                return *status;
            }
        }

        match self.driver.open() {
            Ok(()) => {
                *self.status.lock().unwrap() = DriverStatus::Ok;
                self.start_watchdog();
                info!("virtual display driver opened");
                DriverStatus::Ok
            }
            Err(e) => {
                warn!("virtual display driver failed to open: {e}");
                *self.status.lock().unwrap() = DriverStatus::Failed;
                DriverStatus::Failed
            }
        }
    }

    /// Retry `ensure_open` up to `attempts` times with one-second gaps
    /// (app-catalog refresh path).
    pub async fn reopen_with_retries(self: &Arc<Self>, attempts: u32) -> DriverStatus {
        for attempt in 0..attempts {
            if self.ensure_open() == DriverStatus::Ok {
                return DriverStatus::Ok;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        self.status()
    }

    fn start_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock().unwrap();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let host = Arc::clone(self);
        let interval = self.ping_timeout / 3;
        *slot = Some(tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if host.status() != DriverStatus::Ok {
                    break;
                }
                if host.driver.ping() {
                    failures = 0;
                } else {
                    failures += 1;
                    warn!("virtual display driver ping failed ({failures}/{WATCHDOG_MAX_FAILURES})");
                    if failures >= WATCHDOG_MAX_FAILURES {
                        *host.status.lock().unwrap() = DriverStatus::WatchdogFailed;
                        host.driver.close();
                        warn!("virtual display driver marked failed, handle closed");
                        break;
                    }
                }
            }
        }));
    }

    /// Shut the driver down (process exit).
    pub fn shutdown(&self) {
        if let Some(watchdog) = self.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }
        if self.status() == DriverStatus::Ok {
            self.driver.close();
        }
        *self.status.lock().unwrap() = DriverStatus::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockDriver {
        ping_ok: AtomicBool,
        closed: AtomicBool,
        removals: AtomicUsize,
    }

    impl MockDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ping_ok: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                removals: AtomicUsize::new(0),
            })
        }
    }

    impl VirtualDisplayDriver for MockDriver {
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn ping(&self) -> bool {
            self.ping_ok.load(Ordering::SeqCst)
        }
        fn create_display(&self, request: &VirtualDisplayRequest) -> Result<String> {
            Ok(format!("VDD-{}", request.device_name))
        }
        fn remove_display(&self, _guid: &Uuid) -> bool {
            self.removals.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn change_mode(&self, _d: &str, _w: u32, _h: u32, _f: u32, _i: bool) -> Result<()> {
            Ok(())
        }
        fn hdr_state(&self, _d: &str) -> Option<bool> {
            Some(false)
        }
        fn set_hdr(&self, _d: &str, _e: bool) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn ensure_open_transitions_to_ok() {
        let driver = MockDriver::new();
        let host = VirtualDisplayHost::new(driver, Duration::from_secs(5));
        assert_eq!(host.status(), DriverStatus::Unknown);
        assert_eq!(host.ensure_open(), DriverStatus::Ok);
        // Idempotent.
        assert_eq!(host.ensure_open(), DriverStatus::Ok);
        host.shutdown();
    }

    #[tokio::test]
    async fn watchdog_closes_failed_driver() {
        let driver = MockDriver::new();
        // Ping every 10 ms.
        let host = VirtualDisplayHost::new(Arc::clone(&driver) as _, Duration::from_millis(30));
        assert_eq!(host.ensure_open(), DriverStatus::Ok);

        driver.ping_ok.store(false, Ordering::SeqCst);
        // Three failures at ~10 ms apart; give it comfortable slack.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(host.status(), DriverStatus::WatchdogFailed);
        assert!(driver.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watchdog_tolerates_transient_failures() {
        let driver = MockDriver::new();
        let host = VirtualDisplayHost::new(Arc::clone(&driver) as _, Duration::from_millis(30));
        host.ensure_open();

        // One failed ping, then recovery.
        driver.ping_ok.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        driver.ping_ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(host.status(), DriverStatus::Ok);
        host.shutdown();
    }
}
