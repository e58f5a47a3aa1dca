//! Test utilities for ipp-usb-rs
//!
//! Provides mock device descriptors and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_desc;
//!
//! # fn main() {
//! let desc = create_mock_desc(1, 4);
//! assert_eq!(desc.addr.address, 4);
//! # }
//! ```

use crate::usb_types::{IppInterface, UsbAddr, UsbDeviceDesc};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock IPP-over-USB printer descriptor
///
/// # Arguments
/// * `bus` - Bus number
/// * `address` - Device address on the bus
///
/// # Example
/// ```
/// use common::test_utils::create_mock_desc;
///
/// let desc = create_mock_desc(2, 7);
/// assert_eq!(desc.addr.bus, 2);
/// assert_eq!(desc.interfaces.len(), 2);
/// ```
pub fn create_mock_desc(bus: u8, address: u8) -> UsbDeviceDesc {
    UsbDeviceDesc {
        addr: UsbAddr::new(bus, address),
        vendor_id: 0x04f9,
        product_id: 0x0200 + address as u16,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some(format!("Test Printer {}", address)),
        serial_number: Some(format!("SN{:03}{:03}", bus, address)),
        interfaces: vec![
            create_mock_interface(0, 0x81, 0x01),
            create_mock_interface(1, 0x82, 0x02),
        ],
    }
}

/// Create a mock IPP-over-USB interface
pub fn create_mock_interface(number: u8, bulk_in: u8, bulk_out: u8) -> IppInterface {
    IppInterface {
        number,
        alt_setting: 0,
        bulk_in,
        bulk_out,
    }
}

/// Create descriptors for devices 1..=count on bus 1
///
/// # Example
/// ```
/// use common::test_utils::create_mock_desc_list;
///
/// let descs = create_mock_desc_list(5);
/// assert_eq!(descs.len(), 5);
/// ```
pub fn create_mock_desc_list(count: u8) -> Vec<UsbDeviceDesc> {
    (1..=count).map(|address| create_mock_desc(1, address)).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Arguments
/// * `duration` - Maximum time to wait
/// * `future` - The async operation to run
///
/// # Returns
/// Result containing the operation result or a timeout error
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
