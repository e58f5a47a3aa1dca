//! USB type abstractions shared by the orchestrator and the daemon

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB interface class of printers
pub const USB_CLASS_PRINTER: u8 = 7;
/// Printer interface subclass
pub const USB_SUBCLASS_PRINTER: u8 = 1;
/// IPP-over-USB interface protocol
pub const USB_PROTOCOL_IPP_OVER_USB: u8 = 4;

/// Physical attachment point of a USB device
///
/// The pair is only unique while the device stays plugged in: re-plugging,
/// even into the same port, makes the kernel assign a new device address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UsbAddr {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl UsbAddr {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for UsbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus {:03} Device {:03}", self.bus, self.address)
    }
}

/// One IPP-over-USB interface alternate setting with its bulk endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IppInterface {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alt_setting: u8,
    /// Bulk IN endpoint address (bit 7 set)
    pub bulk_in: u8,
    /// Bulk OUT endpoint address
    pub bulk_out: u8,
}

/// Enumeration record of one IPP-over-USB capable device
///
/// Recomputed on every enumeration; never kept across reconciliation cycles
/// except by the device that was constructed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceDesc {
    /// Where the device is attached
    pub addr: UsbAddr,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// IPP-over-USB interfaces, at most one alternate setting per interface
    pub interfaces: Vec<IppInterface>,
}

impl UsbDeviceDesc {
    /// Human readable "manufacturer product" name, falling back to VID:PID
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) if p.starts_with(m.as_str()) => p.clone(),
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            _ => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}
