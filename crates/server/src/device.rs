//! Per-device IPP-over-USB HTTP bridge
//!
//! [`IppUsbFactory`] turns a [`UsbDeviceDesc`] into a running [`IppUsbDevice`]:
//! the printer interfaces are claimed, a TCP listener is bound on the lowest
//! free port of the configured range and an accept loop pumps every client
//! connection over one free interface.

use crate::ports::{PortAllocator, PortLease};
use crate::pump::{InterfacePool, serve_connection};
use crate::usb::usb_error;
use common::{UsbAddr, UsbDeviceDesc};
use pnp::{Device, DeviceFactory};
use rusb::{Context, DeviceHandle, UsbContext};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Open libusb handle with the IPP interfaces claimed
///
/// Dropping it releases the interfaces and gives detached interfaces back
/// to their kernel driver.
pub struct UsbHandle {
    addr: UsbAddr,
    handle: DeviceHandle<Context>,
    claimed: Vec<u8>,
    detached: Vec<u8>,
}

impl UsbHandle {
    fn open(context: &Context, desc: &UsbDeviceDesc) -> common::Result<Self> {
        let devices = context
            .devices()
            .map_err(|e| usb_error("cannot list USB devices", e))?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == desc.addr.bus && d.address() == desc.addr.address)
            .ok_or_else(|| common::Error::Device(format!("{}: device is gone", desc.addr)))?;

        let handle = device.open().map_err(|e| usb_error("cannot open device", e))?;
        let mut usb = Self {
            addr: desc.addr,
            handle,
            claimed: Vec::new(),
            detached: Vec::new(),
        };

        // Early returns drop `usb`, undoing whatever was claimed so far
        for interface in &desc.interfaces {
            let number = interface.number;

            if let Ok(true) = usb.handle.kernel_driver_active(number) {
                debug!("{}: detaching kernel driver from interface {}", usb.addr, number);
                match usb.handle.detach_kernel_driver(number) {
                    Ok(()) => usb.detached.push(number),
                    Err(e) => warn!(
                        "{}: cannot detach kernel driver from interface {}: {}",
                        usb.addr, number, e
                    ),
                }
            }

            usb.handle
                .claim_interface(number)
                .map_err(|e| usb_error(&format!("claim interface {}", number), e))?;
            usb.claimed.push(number);

            usb.handle
                .set_alternate_setting(number, interface.alt_setting)
                .map_err(|e| {
                    let alt = interface.alt_setting;
                    usb_error(&format!("set alt setting {} of interface {}", alt, number), e)
                })?;
            debug!(
                "{}: claimed interface {} alt setting {}",
                usb.addr, number, interface.alt_setting
            );
        }

        Ok(usb)
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }
}

impl Drop for UsbHandle {
    fn drop(&mut self) {
        for number in self.claimed.drain(..) {
            if let Err(e) = self.handle.release_interface(number) {
                debug!("{}: cannot release interface {}: {}", self.addr, number, e);
            }
        }
        for number in self.detached.drain(..) {
            if let Err(e) = self.handle.attach_kernel_driver(number) {
                debug!(
                    "{}: cannot reattach kernel driver to interface {}: {}",
                    self.addr, number, e
                );
            }
        }
        debug!("{}: USB handle closed", self.addr);
    }
}

/// Builds [`IppUsbDevice`]s for the orchestrator
pub struct IppUsbFactory {
    context: Context,
    ports: PortAllocator,
    bind_ip: IpAddr,
}

impl IppUsbFactory {
    pub fn new(context: Context, ports: PortAllocator, bind_ip: IpAddr) -> Self {
        Self {
            context,
            ports,
            bind_ip,
        }
    }
}

impl DeviceFactory<UsbDeviceDesc> for IppUsbFactory {
    type Device = IppUsbDevice;

    fn construct(&mut self, desc: &UsbDeviceDesc) -> common::Result<IppUsbDevice> {
        let usb = Arc::new(UsbHandle::open(&self.context, desc)?);

        let (listener, lease) = self.ports.bind(self.bind_ip)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        info!(
            "{}: {} listening on {}:{}",
            desc.addr,
            desc.display_name(),
            self.bind_ip,
            lease.port()
        );

        let pool = InterfacePool::new(&desc.interfaces);
        let handler_usb = usb.clone();
        let handler = move |stream| serve_connection(stream, handler_usb.clone(), pool.clone());

        Ok(IppUsbDevice::spawn(desc.addr, listener, lease, Some(usb), handler))
    }
}

/// Running HTTP bridge of one device
pub struct IppUsbDevice {
    addr: UsbAddr,
    port: u16,
    stop: watch::Sender<bool>,
    server: Option<JoinHandle<()>>,
    usb: Option<Arc<UsbHandle>>,
    lease: Option<PortLease>,
}

impl IppUsbDevice {
    fn spawn<H, Fut>(
        addr: UsbAddr,
        listener: TcpListener,
        lease: PortLease,
        usb: Option<Arc<UsbHandle>>,
        handler: H,
    ) -> Self
    where
        H: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let server = tokio::spawn(accept_loop(addr, listener, stop_rx, handler));

        Self {
            addr,
            port: lease.port(),
            stop,
            server: Some(server),
            usb,
            lease: Some(lease),
        }
    }

    #[cfg(test)]
    fn port(&self) -> u16 {
        self.port
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lease.is_none()
    }
}

impl Device for IppUsbDevice {
    /// Stop accepting, then wait for active connections up to `deadline`
    fn shutdown(&mut self, deadline: Instant) -> impl Future<Output = ()> + Send {
        async move {
            self.stop.send_replace(true);

            let Some(server) = self.server.as_mut() else {
                return;
            };
            match tokio::time::timeout_at(deadline, server).await {
                Ok(Ok(())) => {
                    self.server = None;
                    debug!("{}: all connections finished", self.addr);
                }
                Ok(Err(e)) => {
                    self.server = None;
                    warn!("{}: server task failed: {}", self.addr, e);
                }
                Err(_) => {
                    warn!("{}: connections still active at shutdown deadline", self.addr);
                }
            }
        }
    }

    /// Abort remaining connections and release the device and its port
    fn close(&mut self) {
        self.stop.send_replace(true);
        if let Some(server) = self.server.take() {
            server.abort();
        }
        // Transfers still in flight hold the last references briefly
        self.usb.take();
        if self.lease.take().is_some() {
            info!("{}: closed, port {} released", self.addr, self.port);
        }
    }
}

/// Accept clients until stopped, then wait for the ones already accepted
async fn accept_loop<H, Fut>(
    addr: UsbAddr,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
    handler: H,
) where
    H: Fn(TcpStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            // Also fires when the device is dropped
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{}: accepted {}", addr, peer);
                    connections.spawn(handler(stream));
                }
                Err(e) => {
                    warn!("{}: accept failed: {}", addr, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    if !connections.is_empty() {
        debug!("{}: waiting for {} connection(s)", addr, connections.len());
    }
    while connections.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn bind() -> (TcpListener, PortLease) {
        let probe = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (listener, lease) = PortAllocator::new(port, port).bind(LOOPBACK).unwrap();
        listener.set_nonblocking(true).unwrap();
        (TcpListener::from_std(listener).unwrap(), lease)
    }

    async fn echo(mut stream: TcpStream) {
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_active_connection() {
        let (listener, lease) = bind();
        let addr = UsbAddr::new(1, 2);
        let mut device = IppUsbDevice::spawn(addr, listener, lease, None, echo);
        let port = device.port();

        let mut client = TcpStream::connect((LOOPBACK, port)).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0);

        let hang_up = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(client);
        });

        let start = std::time::Instant::now();
        device.shutdown(Instant::now() + Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(device.server.is_none());
        hang_up.await.unwrap();

        // No longer accepting
        assert!(TcpStream::connect((LOOPBACK, port)).await.is_err());

        device.close();
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_at_deadline() {
        let (listener, lease) = bind();
        let addr = UsbAddr::new(1, 3);
        let stuck = |_stream: TcpStream| std::future::pending::<()>();
        let mut device = IppUsbDevice::spawn(addr, listener, lease, None, stuck);

        let _client = TcpStream::connect((LOOPBACK, device.port())).await.unwrap();
        // Let the accept loop pick the client up
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        device.shutdown(Instant::now() + Duration::from_millis(100)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_secs(2));
        assert!(device.server.is_some());

        device.close();
        assert!(device.server.is_none());
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, lease) = bind();
        let mut device = IppUsbDevice::spawn(UsbAddr::new(2, 9), listener, lease, None, echo);

        device.close();
        device.close();
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_without_clients_is_immediate() {
        let (listener, lease) = bind();
        let mut device = IppUsbDevice::spawn(UsbAddr::new(2, 10), listener, lease, None, echo);

        let start = std::time::Instant::now();
        device.shutdown(Instant::now() + Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        device.close();
    }
}
