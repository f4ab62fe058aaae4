//! USB transfer-level type definitions
//!
//! This module defines the endpoint, request and status types shared by the
//! topology core, the transfer backends and the inspection tool.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bit 7 of an endpoint address (or bmRequestType) selects device-to-host
pub const DIRECTION_IN_MASK: u8 = 0x80;

/// Address of the default control endpoint
pub const CONTROL_ENDPOINT: u8 = 0x00;

/// Request ID for matching completions
///
/// Assigned by the caller; the core never interprets it, it only travels with
/// the request so the completion can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Data direction of an endpoint or transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in an endpoint address
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & DIRECTION_IN_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Direction of a control transfer's data stage (bmRequestType bit 7)
    pub fn from_request_type(request_type: u8) -> Self {
        Self::from_endpoint_address(request_type)
    }
}

/// USB endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode the transfer type from an endpoint descriptor's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Endpoint metadata captured when a pipe is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Transfer type
    pub transfer_type: EndpointType,
    /// wMaxPacketSize (payload bytes per packet)
    pub max_packet_size: u16,
    /// bInterval polling interval
    pub interval: u8,
}

impl EndpointInfo {
    pub fn new(address: u8, transfer_type: EndpointType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_endpoint_address(self.address)
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x} {:?} {:?} max_packet={}",
            self.address,
            self.direction(),
            self.transfer_type,
            self.max_packet_size
        )
    }
}

/// Control transfer setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Standard GET_DESCRIPTOR(DEVICE) request
    pub fn get_device_descriptor() -> Self {
        Self {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_request_type(self.request_type)
    }

    /// Little-endian wire encoding
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Region of a request buffer used as a control transfer's data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferRange {
    pub offset: usize,
    pub length: usize,
}

impl BufferRange {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// Range covering a whole buffer of `len` bytes
    pub fn whole(len: usize) -> Self {
        Self {
            offset: 0,
            length: len,
        }
    }

    /// End offset, or None on overflow
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.length)
    }

    /// Whether the range lies inside a buffer of `len` bytes
    pub fn fits(&self, len: usize) -> bool {
        self.end().is_some_and(|end| end <= len)
    }
}

/// Per-packet descriptor of an isochronous transfer
///
/// `offset`/`length` are laid out by the submitter from the packet-size list;
/// `actual_length`/`status` are filled in on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoPacketDescriptor {
    pub offset: u64,
    pub length: u64,
    pub actual_length: u64,
    pub status: Option<UsbError>,
}

impl IsoPacketDescriptor {
    /// Lay out consecutive packets from a list of sizes
    pub fn layout(packet_sizes: &[u64]) -> Vec<IsoPacketDescriptor> {
        let mut offset = 0u64;
        packet_sizes
            .iter()
            .map(|&length| {
                let packet = IsoPacketDescriptor {
                    offset,
                    length,
                    actual_length: 0,
                    status: None,
                };
                offset = offset.saturating_add(length);
                packet
            })
            .collect()
    }
}

/// USB error types
///
/// Transfer-level status reported synchronously or through a completion.
/// Maps to libusb error codes where one exists.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device, interface or endpoint not found
    #[error("not found")]
    NotFound,
    /// Device is busy
    #[error("device busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Transfer was cancelled by an abort
    #[error("transfer cancelled")]
    Cancelled,
    /// Operation not supported by the transfer subsystem
    #[error("operation not supported")]
    NotSupported,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}
