//! Common utilities for ipp-usb-rs
//!
//! This crate provides shared functionality between the orchestrator and the
//! daemon: the error type, logging setup, USB address and descriptor types,
//! and the async channel that carries hot-plug notifications out of the USB thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{HotplugEvent, HotplugListener, HotplugNotifier, create_hotplug_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{IppInterface, UsbAddr, UsbDeviceDesc};
