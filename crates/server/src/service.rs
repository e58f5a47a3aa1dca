//! systemd readiness notifications
//!
//! Minimal sd-notify client. Every call is a no-op when `NOTIFY_SOCKET`
//! is not set, so the daemon behaves the same outside systemd.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

/// Send one state line to the notification socket, if any
fn send(state: &str) -> Result<()> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(());
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(state.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", state))?;
    debug!("Notified systemd: {}", state);
    Ok(())
}

/// Service finished startup and the device loop is running
pub fn notify_ready() -> Result<()> {
    send("READY=1")
}

/// Shutdown sequence has begun
pub fn notify_stopping() -> Result<()> {
    send("STOPPING=1")
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    send(&format!("STATUS={}", status))
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}
