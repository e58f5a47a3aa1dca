//! Device presence orchestrator for ipp-usb-rs
//!
//! Reconciles the IPP-over-USB devices attached to the host against the set
//! of running per-device HTTP bridges, and shuts the whole fleet down within
//! one grace period when the process is asked to terminate.
//!
//! The hardware and the bridges are reached only through the traits in
//! [`device`], so the orchestrator runs unchanged against mocks in tests.

pub mod addr_set;
pub mod device;
pub mod manager;
pub mod registry;
pub mod shutdown;
pub mod signals;

pub use addr_set::{AddrDiff, UsbAddrSet};
pub use device::{Descriptor, Device, DeviceFactory, Enumerator, HotplugSource};
pub use manager::{CycleSummary, ExitReason, Fleet, POLL_INTERVAL, PnpManager};
pub use registry::DeviceRegistry;
pub use shutdown::{DEFAULT_GRACE_PERIOD, ShutdownReport, shutdown_all};
pub use signals::{
    OsSignals, ShutdownListener, ShutdownTrigger, Signal, TerminationSource, shutdown_channel,
};
