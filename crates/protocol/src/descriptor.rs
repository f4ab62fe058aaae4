//! Standard USB device descriptor
//!
//! The raw 18-byte descriptor is fetched once by the transfer backend when a
//! target is created and cached for the target's lifetime.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Length of a standard device descriptor (bLength)
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Descriptor type code for DEVICE
pub const DEVICE_DESCRIPTOR_TYPE: u8 = 0x01;

/// Parsed standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse a raw device descriptor
    ///
    /// Trailing bytes beyond bLength are ignored so a larger read buffer can
    /// be handed in directly.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_DESCRIPTOR_LEN,
                available: raw.len(),
            });
        }
        if raw[1] != DEVICE_DESCRIPTOR_TYPE {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: DEVICE_DESCRIPTOR_TYPE,
                actual: raw[1],
            });
        }
        if (raw[0] as usize) < DEVICE_DESCRIPTOR_LEN {
            return Err(ProtocolError::InvalidLength { length: raw[0] });
        }

        Ok(Self {
            usb_version: LittleEndian::read_u16(&raw[2..4]),
            class: raw[4],
            subclass: raw[5],
            protocol: raw[6],
            max_packet_size_0: raw[7],
            vendor_id: LittleEndian::read_u16(&raw[8..10]),
            product_id: LittleEndian::read_u16(&raw[10..12]),
            device_version: LittleEndian::read_u16(&raw[12..14]),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_number_index: raw[16],
            num_configurations: raw[17],
        })
    }

    /// Encode back into the 18-byte wire form
    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
        raw[0] = DEVICE_DESCRIPTOR_LEN as u8;
        raw[1] = DEVICE_DESCRIPTOR_TYPE;
        LittleEndian::write_u16(&mut raw[2..4], self.usb_version);
        raw[4] = self.class;
        raw[5] = self.subclass;
        raw[6] = self.protocol;
        raw[7] = self.max_packet_size_0;
        LittleEndian::write_u16(&mut raw[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut raw[10..12], self.product_id);
        LittleEndian::write_u16(&mut raw[12..14], self.device_version);
        raw[14] = self.manufacturer_index;
        raw[15] = self.product_index;
        raw[16] = self.serial_number_index;
        raw[17] = self.num_configurations;
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mass storage stick, USB 2.0
    const RAW: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x81, 0x07, 0x81, 0x55, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&RAW).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.max_packet_size_0, 64);
        assert_eq!(desc.vendor_id, 0x0781);
        assert_eq!(desc.product_id, 0x5581);
        assert_eq!(desc.device_version, 0x0100);
        assert_eq!(desc.serial_number_index, 3);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut raw = RAW.to_vec();
        raw.extend_from_slice(&[0xff; 6]);
        assert!(DeviceDescriptor::parse(&raw).is_ok());
    }

    #[test]
    fn test_parse_short_buffer() {
        let err = DeviceDescriptor::parse(&RAW[..10]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: 18,
                available: 10
            }
        ));
    }

    #[test]
    fn test_parse_wrong_type() {
        let mut raw = RAW;
        raw[1] = 0x02;
        assert!(matches!(
            DeviceDescriptor::parse(&raw),
            Err(ProtocolError::UnexpectedDescriptorType { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_to_bytes_matches_raw() {
        let desc = DeviceDescriptor::parse(&RAW).unwrap();
        assert_eq!(desc.to_bytes(), RAW);
    }
}
