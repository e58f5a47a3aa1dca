//! Contracts the orchestrator requires from its collaborators
//!
//! The orchestrator never talks to libusb or sockets itself. It enumerates
//! through an [`Enumerator`], builds devices with a [`DeviceFactory`], waits on
//! a [`HotplugSource`], and drives each [`Device`] through its lifecycle.

use common::{HotplugListener, UsbAddr, UsbDeviceDesc};
use std::future::Future;
use tokio::time::Instant;
use tracing::debug;

/// Enumeration record that names the address it was found at
pub trait Descriptor {
    fn addr(&self) -> UsbAddr;
}

impl Descriptor for UsbDeviceDesc {
    fn addr(&self) -> UsbAddr {
        self.addr
    }
}

/// Source of the current hardware presence
pub trait Enumerator {
    type Desc: Descriptor;

    /// List the devices present right now
    ///
    /// Must not block indefinitely. A transient failure is an `Err`; an empty
    /// vector means nothing is attached.
    fn enumerate(&mut self) -> common::Result<Vec<Self::Desc>>;
}

/// Builds a running device from its descriptor
pub trait DeviceFactory<Desc> {
    type Device: Device;

    fn construct(&mut self, desc: &Desc) -> common::Result<Self::Device>;
}

/// One running per-device bridge
pub trait Device: Send + 'static {
    /// Stop gracefully
    ///
    /// Must return at or before `deadline`, even if the device does not cooperate.
    fn shutdown(&mut self, deadline: Instant) -> impl Future<Output = ()> + Send;

    /// Release every resource
    ///
    /// Idempotent, and safe after an interrupted or skipped `shutdown`.
    fn close(&mut self);
}

/// Notification that device presence may have changed
pub trait HotplugSource {
    /// Wait for the next notification
    ///
    /// Returns false once the source is gone and will never fire again.
    fn changed(&mut self) -> impl Future<Output = bool> + Send;
}

impl HotplugSource for HotplugListener {
    fn changed(&mut self) -> impl Future<Output = bool> + Send {
        async move {
            match self.recv().await {
                Ok(events) => {
                    for event in &events {
                        debug!("PNP {}", event);
                    }
                    true
                }
                Err(_) => false,
            }
        }
    }
}
