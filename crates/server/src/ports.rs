//! HTTP port allocation for per-device listeners
//!
//! Every device gets the lowest free port of the configured range. A port
//! stays reserved for as long as its [`PortLease`] lives, even between the
//! moment a listener is dropped and the kernel lets go of the socket.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Hands out ports from a fixed range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

/// Reservation of one port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(&self.port);
        trace!("Released HTTP port {}", self.port);
    }
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            range: min_port..=max_port,
            in_use: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Bind a listener on the lowest free port of the range
    pub fn bind(&self, ip: IpAddr) -> common::Result<(TcpListener, PortLease)> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());

        for port in self.range.clone() {
            if in_use.contains(&port) {
                continue;
            }
            match TcpListener::bind((ip, port)) {
                Ok(listener) => {
                    in_use.insert(port);
                    trace!("Reserved HTTP port {}", port);
                    let lease = PortLease {
                        port,
                        in_use: self.in_use.clone(),
                    };
                    return Ok((listener, lease));
                }
                // Taken by another process
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(common::Error::Device(format!(
            "no free HTTP port in range {}-{}",
            self.range.start(),
            self.range.end()
        )))
    }
}
