//! ipp-usb daemon
//!
//! Exposes every IPP-over-USB printer attached to the host as a plain HTTP
//! endpoint on a local TCP port, following devices as they come and go.

mod config;
mod device;
mod ports;
mod pump;
mod service;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_hotplug_channel, setup_logging};
use device::IppUsbFactory;
use pnp::{Enumerator, ExitReason, OsSignals, PnpManager};
use ports::PortAllocator;
use tracing::{info, warn};
use usb::{UsbEnumerator, spawn_hotplug_thread};

#[derive(Parser, Debug)]
#[command(name = "ipp-usb")]
#[command(author, version, about = "IPP-over-USB proxy daemon")]
#[command(long_about = "
Bridges IPP-over-USB printers and scanners to local HTTP ports, so that
ordinary IPP, eSCL and web clients can talk to them.

EXAMPLES:
    # Run until stopped by a signal
    ipp-usb

    # Started by udev on device arrival: exit once no device is left
    ipp-usb --udev

    # List IPP-over-USB devices and exit
    ipp-usb --check

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ipp-usb/server.toml
    3. /etc/ipp-usb/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Exit when no IPP-over-USB device is present
    #[arg(long)]
    udev: bool,

    /// List IPP-over-USB devices and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => config::load_config(path).context("Failed to load configuration")?,
        None => config::ServerConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ipp-usb v{}", env!("CARGO_PKG_VERSION"));

    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let mut enumerator = UsbEnumerator::new(context.clone(), config.usb.filters.clone());

    if args.check {
        return check_mode(&mut enumerator);
    }

    // Before the first enumeration, so an early signal is not lost
    let signals = OsSignals::register().context("Failed to install signal handlers")?;

    let (notifier, listener) = create_hotplug_channel();
    let hotplug =
        spawn_hotplug_thread(context.clone(), notifier).context("Failed to spawn hot-plug thread")?;

    let ports = PortAllocator::new(config.network.http_min_port, config.network.http_max_port);
    let factory = IppUsbFactory::new(context, ports, config.network.interface.bind_ip());

    let mode = if args.udev { "udev" } else { "standalone" };
    info!(
        "Running in {} mode, HTTP ports {}-{}",
        mode, config.network.http_min_port, config.network.http_max_port
    );

    let manager = PnpManager::new(enumerator, factory, listener, signals)
        .with_grace_period(config.shutdown.grace_period());

    if service::is_systemd() {
        info!("Running under systemd");
    }
    if let Err(e) = service::notify_ready() {
        warn!("systemd notification failed: {:#}", e);
    }
    if let Err(e) = service::notify_status(&format!("Running in {} mode", mode)) {
        warn!("systemd notification failed: {:#}", e);
    }

    let reason = manager.run(args.udev).await;

    if let Err(e) = service::notify_stopping() {
        warn!("systemd notification failed: {:#}", e);
    }
    hotplug.stop();

    match reason {
        ExitReason::Idle => info!("Exiting: no devices left"),
        ExitReason::Terminated => info!("Exiting: terminated"),
    }
    Ok(())
}

/// Print the devices that would be served
fn check_mode(enumerator: &mut UsbEnumerator) -> Result<()> {
    let devices = enumerator
        .enumerate()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No IPP-over-USB devices found.");
        return Ok(());
    }

    println!("Found {} IPP-over-USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} {:04x}:{:04x} - {}",
            device.addr,
            device.vendor_id,
            device.product_id,
            device.display_name()
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        let numbers: Vec<String> = device
            .interfaces
            .iter()
            .map(|i| i.number.to_string())
            .collect();
        println!("      IPP interfaces: {}", numbers.join(", "));
        println!();
    }

    Ok(())
}
