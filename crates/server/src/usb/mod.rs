//! USB subsystem
//!
//! Enumeration of IPP-over-USB devices and hot-plug detection.
//!
//! Enumeration runs on the orchestrator's task and only touches descriptors.
//! Hot-plug callbacks need `libusb_handle_events()` to be pumped, so they run
//! in a dedicated blocking thread that talks to the Tokio runtime through an
//! async channel.

pub mod enumerate;
pub mod hotplug;

pub use enumerate::UsbEnumerator;
pub use hotplug::{HotplugThread, spawn_hotplug_thread};

/// Wrap a libusb error with what was being attempted
pub fn usb_error(what: &str, e: rusb::Error) -> common::Error {
    common::Error::Usb(format!("{}: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_message() {
        let err = usb_error("claim interface 1", rusb::Error::Busy);
        assert!(err.to_string().starts_with("USB error: claim interface 1:"));
    }
}
