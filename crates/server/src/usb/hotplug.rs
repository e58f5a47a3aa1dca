//! USB hot-plug thread
//!
//! Dedicated thread that owns a libusb hot-plug registration and runs
//! `libusb_handle_events()`. Arrivals and departures are forwarded to the
//! Tokio runtime through a [`HotplugNotifier`]; the orchestrator only uses
//! them as a hint to re-enumerate.

use common::{HotplugEvent, HotplugNotifier, UsbAddr};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before the stop flag is checked
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Running hot-plug thread
pub struct HotplugThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HotplugThread {
    /// Ask the thread to exit and wait for it
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.handle.join() {
            error!("Hot-plug thread panicked: {:?}", e);
        }
    }
}

/// Spawn the hot-plug thread
///
/// If libusb has no hot-plug support on this platform the thread logs a
/// warning and exits, which closes the notification channel.
pub fn spawn_hotplug_thread(
    context: Context,
    notifier: HotplugNotifier,
) -> std::io::Result<HotplugThread> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let handle = std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || run(context, notifier, thread_stop))?;

    Ok(HotplugThread { stop, handle })
}

fn run(context: Context, notifier: HotplugNotifier, stop: Arc<AtomicBool>) {
    if !rusb::has_hotplug() {
        warn!("libusb has no hot-plug support, device changes will not be noticed");
        return;
    }

    let callback = HotplugCallback {
        notifier: notifier.clone(),
    };
    let _registration: rusb::Registration<Context> = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(callback))
    {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Failed to register hot-plug callback: {}", e);
            return;
        }
    };

    info!("USB hot-plug thread started");

    while !stop.load(Ordering::SeqCst) && !notifier.is_closed() {
        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                // Transient errors are retried, never fatal to the thread
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    info!("USB hot-plug thread stopped");
}

/// Forwards libusb hot-plug callbacks into the notification channel
struct HotplugCallback {
    notifier: HotplugNotifier,
}

impl HotplugCallback {
    fn forward(&self, event: HotplugEvent) {
        debug!("Hot-plug callback: {}", event);
        if let Err(e) = self.notifier.notify(event) {
            debug!("Dropping hot-plug event: {}", e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(HotplugEvent::Arrived(UsbAddr::new(
            device.bus_number(),
            device.address(),
        )));
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(HotplugEvent::Left(UsbAddr::new(
            device.bus_number(),
            device.address(),
        )));
    }
}
