//! Registry of running devices, keyed by USB address

use common::UsbAddr;
use std::collections::HashMap;

/// Owner of every running device
///
/// A device leaves the registry only by being removed (and then closed by
/// the caller) or by the whole registry being handed to the shutdown coordinator.
#[derive(Debug)]
pub struct DeviceRegistry<D> {
    devices: HashMap<UsbAddr, D>,
}

impl<D> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }
}

impl<D> DeviceRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, returning the one previously stored at `addr`
    pub fn insert(&mut self, addr: UsbAddr, device: D) -> Option<D> {
        self.devices.insert(addr, device)
    }

    /// Take a device out of the registry
    pub fn remove(&mut self, addr: &UsbAddr) -> Option<D> {
        self.devices.remove(addr)
    }

    pub fn get(&self, addr: &UsbAddr) -> Option<&D> {
        self.devices.get(addr)
    }

    pub fn contains(&self, addr: &UsbAddr) -> bool {
        self.devices.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Addresses of all registered devices, in no particular order
    pub fn addrs(&self) -> impl Iterator<Item = &UsbAddr> {
        self.devices.keys()
    }
}

impl<D> IntoIterator for DeviceRegistry<D> {
    type Item = (UsbAddr, D);
    type IntoIter = std::collections::hash_map::IntoIter<UsbAddr, D>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}
