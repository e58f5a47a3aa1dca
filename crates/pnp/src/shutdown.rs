//! Fleet shutdown under one shared grace deadline
//!
//! Every registered device gets its own task that runs `shutdown(deadline)`
//! followed by `close()`. All tasks share the same deadline, so the whole
//! fleet stops within about one grace period no matter how many devices
//! there are. The coordinator joins every task before returning.

use crate::device::Device;
use crate::registry::DeviceRegistry;
use common::UsbAddr;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default grace period for fleet shutdown
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Outcome of [`shutdown_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Devices that were shut down and closed
    pub devices: usize,
    /// Devices whose shutdown returned after the deadline
    pub overran: Vec<UsbAddr>,
    /// Devices whose shutdown panicked (they were still closed)
    pub panicked: Vec<UsbAddr>,
}

/// Closes the device when dropped, including while unwinding from a panic
struct CloseGuard<D: Device> {
    device: D,
    closed: bool,
}

impl<D: Device> CloseGuard<D> {
    fn new(device: D) -> Self {
        Self {
            device,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.device.close();
        }
    }
}

impl<D: Device> Drop for CloseGuard<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shut down and close every device in `registry` concurrently
///
/// The deadline is fixed once, when this function is called. A device that
/// ignores the deadline delays the return of this function; that is reported
/// in [`ShutdownReport::overran`] and logged, never silently tolerated.
pub async fn shutdown_all<D: Device>(
    registry: DeviceRegistry<D>,
    grace_period: Duration,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    if registry.is_empty() {
        debug!("No devices to shut down");
        return report;
    }

    let deadline = Instant::now() + grace_period;
    info!(
        "Shutting down {} device(s), grace period {:?}",
        registry.len(),
        grace_period
    );

    let mut tasks = JoinSet::new();
    let mut task_addrs = HashMap::new();

    for (addr, device) in registry {
        let abort = tasks.spawn(async move {
            let mut guard = CloseGuard::new(device);
            guard.device.shutdown(deadline).await;
            let returned = Instant::now();
            guard.close();
            (addr, returned)
        });
        task_addrs.insert(abort.id(), addr);
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_id, (addr, returned))) => {
                report.devices += 1;
                if returned > deadline {
                    warn!(
                        "{}: shutdown ignored the grace deadline by {:?}",
                        addr,
                        returned - deadline
                    );
                    report.overran.push(addr);
                } else {
                    debug!("{}: closed", addr);
                }
            }
            Err(e) => {
                let addr = task_addrs.get(&e.id()).copied();
                match addr {
                    Some(addr) => {
                        error!("{}: shutdown failed: {}", addr, e);
                        report.devices += 1;
                        report.panicked.push(addr);
                    }
                    None => error!("Shutdown task failed: {}", e),
                }
            }
        }
    }

    info!("All devices closed");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device whose shutdown takes a fixed time, optionally past the deadline
    struct SlowDevice {
        delay: Duration,
        honor_deadline: bool,
        closes: Arc<AtomicUsize>,
    }

    impl Device for SlowDevice {
        async fn shutdown(&mut self, deadline: Instant) {
            let done = Instant::now() + self.delay;
            if self.honor_deadline {
                tokio::time::sleep_until(done.min(deadline)).await;
            } else {
                tokio::time::sleep_until(done).await;
            }
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingDevice {
        closes: Arc<AtomicUsize>,
    }

    impl Device for PanickingDevice {
        async fn shutdown(&mut self, _deadline: Instant) {
            panic!("device exploded");
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn slow_registry(
        count: u8,
        delay: Duration,
        honor_deadline: bool,
        closes: &Arc<AtomicUsize>,
    ) -> DeviceRegistry<SlowDevice> {
        let mut registry = DeviceRegistry::new();
        for address in 1..=count {
            registry.insert(
                UsbAddr::new(1, address),
                SlowDevice {
                    delay,
                    honor_deadline,
                    closes: closes.clone(),
                },
            );
        }
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_returns_immediately() {
        let start = Instant::now();
        let report = shutdown_all(DeviceRegistry::<SlowDevice>::new(), DEFAULT_GRACE_PERIOD).await;

        assert_eq!(report, ShutdownReport::default());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_shutdown_takes_one_grace_period() {
        let closes = Arc::new(AtomicUsize::new(0));
        let registry = slow_registry(8, Duration::from_secs(60), true, &closes);

        let start = Instant::now();
        let report = shutdown_all(registry, DEFAULT_GRACE_PERIOD).await;
        let elapsed = start.elapsed();

        assert_eq!(report.devices, 8);
        assert!(report.overran.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 8);
        assert!(elapsed >= DEFAULT_GRACE_PERIOD);
        assert!(elapsed < DEFAULT_GRACE_PERIOD * 2, "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_devices_do_not_wait_for_deadline() {
        let closes = Arc::new(AtomicUsize::new(0));
        let registry = slow_registry(3, Duration::from_millis(10), true, &closes);

        let start = Instant::now();
        shutdown_all(registry, DEFAULT_GRACE_PERIOD).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_overrun_is_reported() {
        let closes = Arc::new(AtomicUsize::new(0));
        let registry = slow_registry(2, Duration::from_secs(7), false, &closes);

        let start = Instant::now();
        let report = shutdown_all(registry, DEFAULT_GRACE_PERIOD).await;

        // The coordinator still waits for the misbehaving devices
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(report.overran.len(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_shutdown_still_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = DeviceRegistry::new();
        registry.insert(
            UsbAddr::new(3, 1),
            PanickingDevice {
                closes: closes.clone(),
            },
        );

        let report = shutdown_all(registry, DEFAULT_GRACE_PERIOD).await;

        assert_eq!(report.panicked, vec![UsbAddr::new(3, 1)]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_guard_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = CloseGuard::new(SlowDevice {
            delay: Duration::ZERO,
            honor_deadline: true,
            closes: closes.clone(),
        });

        guard.close();
        guard.close();
        drop(guard);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
