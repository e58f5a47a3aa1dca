//! IPP-over-USB device enumeration
//!
//! Walks the libusb device list and reports every device that exposes at
//! least one printer interface speaking IPP over USB (class 7, subclass 1,
//! protocol 4) with a bulk IN/OUT endpoint pair.
//!
//! String descriptors cost control transfers, so they are read once per
//! address and reused for as long as the device stays attached.

use common::usb_types::{USB_CLASS_PRINTER, USB_PROTOCOL_IPP_OVER_USB, USB_SUBCLASS_PRINTER};
use crate::config::UsbFilter;
use common::{IppInterface, UsbAddr, UsbDeviceDesc};
use pnp::Enumerator;
use rusb::{Context, Device, DeviceDescriptor, Direction, TransferType, UsbContext};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Timeout for reading string descriptors
const STRING_TIMEOUT: Duration = Duration::from_millis(500);

/// Manufacturer, product and serial number
type Strings = (Option<String>, Option<String>, Option<String>);

/// String descriptors of the devices seen in the last pass
#[derive(Debug, Default)]
struct StringCache {
    previous: HashMap<UsbAddr, Strings>,
    current: HashMap<UsbAddr, Strings>,
}

impl StringCache {
    fn get_or_read(&mut self, addr: UsbAddr, read: impl FnOnce() -> Strings) -> Strings {
        let strings = self.previous.remove(&addr).unwrap_or_else(read);
        self.current.insert(addr, strings.clone());
        strings
    }

    /// Drop entries of devices the finished pass did not see
    fn end_pass(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }
}

/// Enumerates IPP-over-USB devices allowed by the configured filters
pub struct UsbEnumerator {
    context: Context,
    filters: Vec<UsbFilter>,
    strings: StringCache,
}

impl UsbEnumerator {
    pub fn new(context: Context, filters: Vec<UsbFilter>) -> Self {
        Self {
            context,
            filters,
            strings: StringCache::default(),
        }
    }

    /// Build a descriptor for `device`, or `None` if it is not served
    fn describe(&mut self, device: &Device<Context>) -> Option<UsbDeviceDesc> {
        let addr = UsbAddr::new(device.bus_number(), device.address());

        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("{}: cannot read device descriptor: {}", addr, e);
                return None;
            }
        };

        if !check_filter(descriptor.vendor_id(), descriptor.product_id(), &self.filters) {
            trace!(
                "{}: ignored by filter, vid={:#06x}, pid={:#06x}",
                addr,
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            return None;
        }

        let config = device
            .active_config_descriptor()
            .or_else(|_| device.config_descriptor(0))
            .ok()?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            // One alternate setting per interface is enough
            let found = interface.descriptors().find_map(|alt| {
                if !is_ipp_over_usb(alt.class_code(), alt.sub_class_code(), alt.protocol_code()) {
                    return None;
                }
                let endpoints = alt.endpoint_descriptors().map(|ep| {
                    (ep.address(), ep.transfer_type(), ep.direction())
                });
                let (bulk_in, bulk_out) = bulk_pair(endpoints)?;
                Some(IppInterface {
                    number: alt.interface_number(),
                    alt_setting: alt.setting_number(),
                    bulk_in,
                    bulk_out,
                })
            });
            interfaces.extend(found);
        }

        if interfaces.is_empty() {
            return None;
        }

        let (manufacturer, product, serial_number) = self
            .strings
            .get_or_read(addr, || read_strings(device, &descriptor));

        Some(UsbDeviceDesc {
            addr,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer,
            product,
            serial_number,
            interfaces,
        })
    }
}

impl Enumerator for UsbEnumerator {
    type Desc = UsbDeviceDesc;

    fn enumerate(&mut self) -> common::Result<Vec<UsbDeviceDesc>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| common::Error::Enumeration(format!("cannot list USB devices: {}", e)))?;

        let descs: Vec<_> = devices.iter().filter_map(|d| self.describe(&d)).collect();
        self.strings.end_pass();
        trace!("Enumerated {} IPP-over-USB device(s)", descs.len());
        Ok(descs)
    }
}

/// Interface class triple of IPP over USB
fn is_ipp_over_usb(class: u8, subclass: u8, protocol: u8) -> bool {
    class == USB_CLASS_PRINTER
        && subclass == USB_SUBCLASS_PRINTER
        && protocol == USB_PROTOCOL_IPP_OVER_USB
}

/// First bulk IN and first bulk OUT endpoint addresses, if both exist
fn bulk_pair<I>(endpoints: I) -> Option<(u8, u8)>
where
    I: IntoIterator<Item = (u8, TransferType, Direction)>,
{
    let mut bulk_in = None;
    let mut bulk_out = None;

    for (address, transfer_type, direction) in endpoints {
        if transfer_type != TransferType::Bulk {
            continue;
        }
        match direction {
            Direction::In => {
                bulk_in.get_or_insert(address);
            }
            Direction::Out => {
                bulk_out.get_or_insert(address);
            }
        }
    }

    Some((bulk_in?, bulk_out?))
}

/// Read manufacturer, product and serial strings; missing ones are `None`
fn read_strings(device: &Device<Context>, descriptor: &DeviceDescriptor) -> Strings {
    let Ok(handle) = device.open() else {
        return (None, None, None);
    };
    let Some(language) = handle
        .read_languages(STRING_TIMEOUT)
        .ok()
        .and_then(|langs| langs.first().copied())
    else {
        return (None, None, None);
    };

    let manufacturer = handle
        .read_manufacturer_string(language, descriptor, STRING_TIMEOUT)
        .ok();
    let product = handle
        .read_product_string(language, descriptor, STRING_TIMEOUT)
        .ok();
    let serial_number = handle
        .read_serial_number_string(language, descriptor, STRING_TIMEOUT)
        .ok();

    (manufacturer, product, serial_number)
}

/// Check if a VID/PID pair is allowed by the filters
///
/// An empty filter list allows every device.
pub fn check_filter(vid: u16, pid: u16, filters: &[UsbFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vid, pid))
}
