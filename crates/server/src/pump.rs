//! TCP connection to IPP-over-USB interface byte pump
//!
//! IPP over USB carries plain HTTP/1.1 over the bulk endpoints of each
//! printer interface, one HTTP connection per interface at a time. Every
//! accepted TCP connection leases a free interface from the pool and copies
//! bytes both ways until either side closes.
//!
//! libusb transfers are synchronous, so each one runs on the blocking pool.

use crate::device::UsbHandle;
use common::IppInterface;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Timeout for bulk OUT transfers
const BULK_OUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN transfers time out quickly so the reader notices a closed client
const BULK_IN_POLL: Duration = Duration::from_millis(100);

/// Buffer size for both directions
const BUFFER_SIZE: usize = 16 * 1024;

/// Free interfaces of one device
#[derive(Clone)]
pub struct InterfacePool {
    tx: async_channel::Sender<IppInterface>,
    rx: async_channel::Receiver<IppInterface>,
}

/// One interface taken from the pool, given back on drop
pub struct InterfaceLease {
    interface: IppInterface,
    tx: async_channel::Sender<IppInterface>,
}

impl InterfaceLease {
    pub fn interface(&self) -> IppInterface {
        self.interface
    }
}

impl Drop for InterfaceLease {
    fn drop(&mut self) {
        let _ = self.tx.try_send(self.interface);
    }
}

impl InterfacePool {
    pub fn new(interfaces: &[IppInterface]) -> Self {
        let (tx, rx) = async_channel::bounded(interfaces.len().max(1));
        for interface in interfaces {
            let _ = tx.try_send(*interface);
        }
        Self { tx, rx }
    }

    /// Wait for a free interface
    pub async fn acquire(&self) -> io::Result<InterfaceLease> {
        let interface = self
            .rx
            .recv()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(InterfaceLease {
            interface,
            tx: self.tx.clone(),
        })
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

/// Serve one accepted TCP connection over a leased interface
pub async fn serve_connection(
    stream: TcpStream,
    usb: Arc<UsbHandle>,
    pool: InterfacePool,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());

    if pool.available() == 0 {
        debug!("{}: all interfaces busy, waiting", peer);
    }
    let lease = match pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => {
            warn!("{}: no interface available: {}", peer, e);
            return;
        }
    };
    let interface = lease.interface();
    debug!("{}: connected via interface {}", peer, interface.number);

    let (mut reader, mut writer) = stream.into_split();

    let upstream = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, io::Error>(());
            }
            bulk_write(usb.clone(), interface.bulk_out, buf[..n].to_vec()).await?;
        }
    };

    let downstream = async {
        loop {
            let data = bulk_read(usb.clone(), interface.bulk_in).await?;
            if !data.is_empty() {
                writer.write_all(&data).await?;
            }
        }
    };

    let result = tokio::select! {
        r = upstream => r,
        r = downstream => r,
    };

    match result {
        Ok(()) => debug!("{}: closed", peer),
        Err(e) => debug!("{}: connection ended: {}", peer, e),
    }
}

/// Write all of `data` to a bulk OUT endpoint
async fn bulk_write(usb: Arc<UsbHandle>, endpoint: u8, data: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut offset = 0;
        while offset < data.len() {
            let n = usb
                .handle()
                .write_bulk(endpoint, &data[offset..], BULK_OUT_TIMEOUT)
                .map_err(map_rusb_error)?;
            trace!("Bulk OUT {:#04x}: {} bytes", endpoint, n);
            offset += n;
        }
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Read whatever the device has on a bulk IN endpoint; empty on timeout
async fn bulk_read(usb: Arc<UsbHandle>, endpoint: u8) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; BUFFER_SIZE];
        match usb.handle().read_bulk(endpoint, &mut buf, BULK_IN_POLL) {
            Ok(n) => {
                trace!("Bulk IN {:#04x}: {} bytes", endpoint, n);
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(map_rusb_error(e)),
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Map a libusb transfer error to an I/O error
fn map_rusb_error(e: rusb::Error) -> io::Error {
    let kind = match e {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::NoDevice | rusb::Error::NotFound => io::ErrorKind::NotConnected,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_interface, with_timeout};

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice).kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(map_rusb_error(rusb::Error::Pipe).kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(map_rusb_error(rusb::Error::Overflow).kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_pool_lease_returns_on_drop() {
        let pool = InterfacePool::new(&[
            create_mock_interface(0, 0x81, 0x01),
            create_mock_interface(1, 0x82, 0x02),
        ]);
        assert_eq!(pool.available(), 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.interface().number, second.interface().number);
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_pool_waits_for_free_interface() {
        let pool = InterfacePool::new(&[create_mock_interface(0, 0x81, 0x01)]);
        let lease = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|l| l.interface().number) })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        let number = with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(number, 0);
    }
}
