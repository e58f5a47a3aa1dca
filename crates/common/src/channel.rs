//! Async channel bridge between the USB hotplug thread and the Tokio runtime

use crate::usb_types::UsbAddr;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::fmt;

/// Capacity of the hotplug channel
///
/// Events beyond this are dropped: any queued event already wakes the listener,
/// and the listener re-enumerates instead of trusting individual events.
const HOTPLUG_CHANNEL_CAPACITY: usize = 64;

/// Hot-plug notification from the USB thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// Device connected
    Arrived(UsbAddr),
    /// Device disconnected
    Left(UsbAddr),
}

impl HotplugEvent {
    /// Address the event refers to
    pub fn addr(&self) -> UsbAddr {
        match self {
            HotplugEvent::Arrived(addr) | HotplugEvent::Left(addr) => *addr,
        }
    }
}

impl fmt::Display for HotplugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugEvent::Arrived(addr) => write!(f, "{}: arrived", addr),
            HotplugEvent::Left(addr) => write!(f, "{}: left", addr),
        }
    }
}

/// Sending side, owned by the USB thread (non-blocking)
#[derive(Clone)]
pub struct HotplugNotifier {
    event_tx: Sender<HotplugEvent>,
}

impl HotplugNotifier {
    /// Queue an event without blocking
    ///
    /// A full channel is not an error: the listener has pending work already.
    pub fn notify(&self, event: HotplugEvent) -> crate::Result<()> {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                Err(crate::Error::Channel("hotplug listener closed".to_string()))
            }
        }
    }

    /// True once the listener has been dropped
    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Receiving side, owned by the orchestrator (async)
pub struct HotplugListener {
    event_rx: Receiver<HotplugEvent>,
}

impl HotplugListener {
    /// Wait for at least one event, then drain whatever else is queued
    ///
    /// Bursts (a hub with several devices, re-enumeration after reset) are
    /// coalesced into one wakeup. Fails once every notifier is gone.
    pub async fn recv(&self) -> crate::Result<Vec<HotplugEvent>> {
        let first = self
            .event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))?;

        let mut events = vec![first];
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(events)
    }

    /// Close the channel from the receiving side
    pub fn close(&self) {
        self.event_rx.close();
    }
}

/// Create the channel bridge between the USB thread and Tokio
///
/// Returns (HotplugNotifier for the USB thread, HotplugListener for Tokio)
pub fn create_hotplug_channel() -> (HotplugNotifier, HotplugListener) {
    let (event_tx, event_rx) = bounded(HOTPLUG_CHANNEL_CAPACITY);
    (HotplugNotifier { event_tx }, HotplugListener { event_rx })
}
