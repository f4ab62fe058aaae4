//! Test utilities for usb-target
//!
//! Provides device fixtures and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{bulk_in, create_mock_device_descriptor};
//! use protocol::DeviceDescriptor;
//!
//! let desc = DeviceDescriptor::parse(&create_mock_device_descriptor()).unwrap();
//! assert_eq!(desc.vendor_id, 0x1234);
//! assert_eq!(bulk_in(1, 512).address, 0x81);
//! ```

use protocol::{EndpointInfo, EndpointType, RequestId, SetupPacket};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock USB device descriptor (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Bulk IN endpoint `number`
pub fn bulk_in(number: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo::new(0x80 | (number & 0x0f), EndpointType::Bulk, max_packet_size)
}

/// Bulk OUT endpoint `number`
pub fn bulk_out(number: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo::new(number & 0x0f, EndpointType::Bulk, max_packet_size)
}

/// Interrupt IN endpoint `number` polled every `interval` frames
pub fn interrupt_in(number: u8, max_packet_size: u16, interval: u8) -> EndpointInfo {
    EndpointInfo {
        interval,
        ..EndpointInfo::new(0x80 | (number & 0x0f), EndpointType::Interrupt, max_packet_size)
    }
}

/// Isochronous IN endpoint `number`
pub fn iso_in(number: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        interval: 1,
        ..EndpointInfo::new(0x80 | (number & 0x0f), EndpointType::Isochronous, max_packet_size)
    }
}

/// Isochronous OUT endpoint `number`
pub fn iso_out(number: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        interval: 1,
        ..EndpointInfo::new(number & 0x0f, EndpointType::Isochronous, max_packet_size)
    }
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a mock control transfer setup packet
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

/// Next unique RequestId for this test process
pub fn next_request_id() -> RequestId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging
/// when an expected completion never fires.
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
