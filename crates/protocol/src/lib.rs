//! USB data types for usb-target
//!
//! This crate defines the endpoint metadata, control setup packets, isochronous
//! packet descriptors, device descriptor parsing and the transfer status codes
//! shared by the topology core, its transfer backends and the inspection tool.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceDescriptor, Direction, EndpointInfo, EndpointType};
//!
//! let ep = EndpointInfo::new(0x81, EndpointType::Bulk, 512);
//! assert_eq!(ep.direction(), Direction::In);
//!
//! let raw = [
//!     0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56,
//!     0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
//! ];
//! let desc = DeviceDescriptor::parse(&raw).unwrap();
//! assert_eq!(desc.vendor_id, 0x1234);
//! ```

pub mod descriptor;
pub mod error;
pub mod types;

pub use descriptor::{DEVICE_DESCRIPTOR_LEN, DeviceDescriptor};
pub use error::{ProtocolError, Result};
pub use types::{
    BufferRange, CONTROL_ENDPOINT, DIRECTION_IN_MASK, Direction, EndpointInfo, EndpointType,
    IsoPacketDescriptor, RequestId, SetupPacket, UsbError,
};
