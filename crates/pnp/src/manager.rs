//! PnP manager: keeps the set of running devices in step with the hardware
//!
//! Each reconciliation cycle enumerates the bus, diffs the result against the
//! addresses known from the previous cycle, constructs devices for new
//! addresses and closes devices whose address disappeared. Between cycles the
//! manager sleeps until a hot-plug notification or a termination request.
//!
//! ```text
//! enumerate ─> diff ─> add / remove ─> idle? ──yes──> Idle
//!     ^                                  │no
//!     └──────── hot-plug <──── wait <────┘
//!                               │ signal
//!                               v
//!                       shutdown_all ─> Terminated
//! ```

use crate::addr_set::UsbAddrSet;
use crate::device::{Descriptor, Device, DeviceFactory, Enumerator, HotplugSource};
use crate::registry::DeviceRegistry;
use crate::shutdown::{DEFAULT_GRACE_PERIOD, shutdown_all};
use crate::signals::{Signal, TerminationSource};
use common::UsbAddr;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Re-enumeration period when no hot-plug notifications are available
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why [`PnpManager::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No devices left and exit-when-idle was requested
    Idle,
    /// A termination request was received; every device has been closed
    Terminated,
}

/// Counts of what one reconciliation cycle changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Fleet state owned by one [`PnpManager::run`] invocation
///
/// After every completed [`Fleet::reconcile`] the known address set and the
/// registry keys are the same set.
#[derive(Debug)]
pub struct Fleet<D> {
    known: UsbAddrSet,
    registry: DeviceRegistry<D>,
}

impl<D> Default for Fleet<D> {
    fn default() -> Self {
        Self {
            known: UsbAddrSet::new(),
            registry: DeviceRegistry::new(),
        }
    }
}

impl<D: Device> Fleet<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses the fleet currently serves
    pub fn known(&self) -> &UsbAddrSet {
        &self.known
    }

    pub fn registry(&self) -> &DeviceRegistry<D> {
        &self.registry
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Hand the registry over for shutdown
    pub fn into_registry(self) -> DeviceRegistry<D> {
        self.registry
    }

    /// Apply one enumeration result
    ///
    /// An address whose construction fails is dropped from the known set, so
    /// the next enumeration that still reports it classifies it as added again.
    pub fn reconcile<Desc, F>(&mut self, descs: Vec<Desc>, factory: &mut F) -> CycleSummary
    where
        Desc: Descriptor,
        F: DeviceFactory<Desc, Device = D>,
    {
        let mut by_addr: HashMap<UsbAddr, Desc> =
            descs.into_iter().map(|desc| (desc.addr(), desc)).collect();
        let present: UsbAddrSet = by_addr.keys().copied().collect();

        let diff = self.known.diff(&present);
        self.known = present;

        let mut summary = CycleSummary::default();

        for addr in diff.added {
            debug!("PNP {}: added", addr);
            let Some(desc) = by_addr.remove(&addr) else {
                continue;
            };
            match factory.construct(&desc) {
                Ok(device) => {
                    if let Some(mut stale) = self.registry.insert(addr, device) {
                        stale.close();
                    }
                    summary.added += 1;
                }
                Err(e) => {
                    error!("PNP {}: {}", addr, e);
                    self.known.remove(&addr);
                    summary.failed += 1;
                }
            }
        }

        for addr in diff.removed {
            debug!("PNP {}: removed", addr);
            if let Some(mut device) = self.registry.remove(&addr) {
                device.close();
                summary.removed += 1;
            }
        }

        summary
    }
}

/// Device fleet orchestrator
///
/// Generic over its collaborators so that tests can drive it with mock
/// hardware and synthetic termination requests.
pub struct PnpManager<E, F, H, T> {
    enumerator: E,
    factory: F,
    hotplug: H,
    termination: T,
    grace_period: Duration,
}

impl<E, F, H, T> PnpManager<E, F, H, T>
where
    E: Enumerator,
    F: DeviceFactory<E::Desc>,
    H: HotplugSource,
    T: TerminationSource,
{
    pub fn new(enumerator: E, factory: F, hotplug: H, termination: T) -> Self {
        Self {
            enumerator,
            factory,
            hotplug,
            termination,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Override the shared shutdown deadline
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Serve hot-plug events until idle or terminated
    ///
    /// With `exit_when_idle`, returns [`ExitReason::Idle`] as soon as a cycle
    /// ends with no devices. Otherwise runs until a termination request, then
    /// shuts down every device and returns [`ExitReason::Terminated`].
    pub async fn run(mut self, exit_when_idle: bool) -> ExitReason {
        let mut fleet: Fleet<F::Device> = Fleet::new();
        let mut hotplug_alive = true;

        loop {
            match self.enumerator.enumerate() {
                Ok(descs) => {
                    let summary = fleet.reconcile(descs, &mut self.factory);
                    if summary != CycleSummary::default() {
                        debug!(
                            "PNP cycle: {} added, {} removed, {} failed, {} active",
                            summary.added,
                            summary.removed,
                            summary.failed,
                            fleet.registry().len()
                        );
                    }
                }
                // Not "nothing present": keep the fleet as it is
                Err(e) => warn!("PNP: device enumeration failed: {}", e),
            }

            if exit_when_idle && fleet.is_empty() {
                info!("No IPP-over-USB devices present, exiting");
                return ExitReason::Idle;
            }

            if let Some(signal) = self.wait(&mut hotplug_alive).await {
                info!("{} signal received, exiting", signal);
                break;
            }
        }

        shutdown_all(fleet.into_registry(), self.grace_period).await;
        ExitReason::Terminated
    }

    /// Sleep until the next cycle is due (`None`) or a termination request
    ///
    /// A cycle is due on a hot-plug notification, or every [`POLL_INTERVAL`]
    /// once the hot-plug source is gone.
    async fn wait(&mut self, hotplug_alive: &mut bool) -> Option<Signal> {
        loop {
            tokio::select! {
                biased;

                signal = self.termination.recv() => return Some(signal),

                changed = self.hotplug.changed(), if *hotplug_alive => {
                    if changed {
                        return None;
                    }
                    warn!(
                        "PNP: hot-plug notifications stopped, polling every {:?}",
                        POLL_INTERVAL
                    );
                    *hotplug_alive = false;
                }

                _ = tokio::time::sleep(POLL_INTERVAL), if !*hotplug_alive => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UsbDeviceDesc;
    use common::test_utils::create_mock_desc;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Log {
        closed: Vec<UsbAddr>,
    }

    struct TestDevice {
        addr: UsbAddr,
        log: Arc<Mutex<Log>>,
    }

    impl Device for TestDevice {
        async fn shutdown(&mut self, _deadline: Instant) {}

        fn close(&mut self) {
            self.log.lock().unwrap().closed.push(self.addr);
        }
    }

    struct TestFactory {
        failing: Vec<UsbAddr>,
        log: Arc<Mutex<Log>>,
    }

    impl DeviceFactory<UsbDeviceDesc> for TestFactory {
        type Device = TestDevice;

        fn construct(&mut self, desc: &UsbDeviceDesc) -> common::Result<TestDevice> {
            if self.failing.contains(&desc.addr) {
                return Err(common::Error::Device("resource busy".to_string()));
            }
            Ok(TestDevice {
                addr: desc.addr,
                log: self.log.clone(),
            })
        }
    }

    fn factory(failing: &[UsbAddr]) -> TestFactory {
        TestFactory {
            failing: failing.to_vec(),
            log: Arc::new(Mutex::new(Log::default())),
        }
    }

    fn assert_consistent(fleet: &Fleet<TestDevice>) {
        let mut known: Vec<_> = fleet.known().iter().copied().collect();
        let mut registered: Vec<_> = fleet.registry().addrs().copied().collect();
        known.sort();
        registered.sort();
        assert_eq!(known, registered);
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let mut factory = factory(&[]);
        let mut fleet = Fleet::new();

        let descs = vec![create_mock_desc(1, 1), create_mock_desc(1, 2)];
        let summary = fleet.reconcile(descs, &mut factory);
        assert_eq!(summary.added, 2);
        assert_consistent(&fleet);

        let descs = vec![create_mock_desc(1, 2), create_mock_desc(1, 3)];
        let summary = fleet.reconcile(descs, &mut factory);
        assert_eq!(
            summary,
            CycleSummary {
                added: 1,
                removed: 1,
                failed: 0
            }
        );
        assert_consistent(&fleet);
        assert_eq!(factory.log.lock().unwrap().closed, vec![UsbAddr::new(1, 1)]);
    }

    #[test]
    fn test_failed_construction_is_isolated_and_retried() {
        let busy = UsbAddr::new(1, 2);
        let mut factory = factory(&[busy]);
        let mut fleet = Fleet::new();

        let descs = || vec![create_mock_desc(1, 1), create_mock_desc(1, 2), create_mock_desc(1, 3)];

        let summary = fleet.reconcile(descs(), &mut factory);
        assert_eq!(summary.added, 2);
        assert_eq!(summary.failed, 1);
        assert!(!fleet.registry().contains(&busy));
        assert!(fleet.registry().contains(&UsbAddr::new(1, 1)));
        assert!(fleet.registry().contains(&UsbAddr::new(1, 3)));
        assert_consistent(&fleet);

        // Still present and no longer busy: picked up as added again
        factory.failing.clear();
        let summary = fleet.reconcile(descs(), &mut factory);
        assert_eq!(summary.added, 1);
        assert!(fleet.registry().contains(&busy));
        assert_consistent(&fleet);
    }

    #[test]
    fn test_removed_without_registry_entry_is_noop() {
        let ghost = UsbAddr::new(2, 9);
        let mut factory = factory(&[]);
        let mut fleet: Fleet<TestDevice> = Fleet::new();
        fleet.known.insert(ghost);

        let summary = fleet.reconcile(Vec::<UsbDeviceDesc>::new(), &mut factory);

        assert_eq!(summary, CycleSummary::default());
        assert!(factory.log.lock().unwrap().closed.is_empty());
        assert!(fleet.is_empty());
    }

    #[test]
    fn test_duplicate_descriptors_collapse() {
        let mut factory = factory(&[]);
        let mut fleet = Fleet::new();

        let descs = vec![create_mock_desc(1, 4), create_mock_desc(1, 4)];
        let summary = fleet.reconcile(descs, &mut factory);

        assert_eq!(summary.added, 1);
        assert_eq!(fleet.registry().len(), 1);
    }
}
