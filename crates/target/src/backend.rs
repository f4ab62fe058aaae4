//! Transfer subsystem seam
//!
//! The topology core never talks to hardware directly. Everything it needs
//! from the bound device goes through [`UsbBackend`]: descriptor and endpoint
//! queries, alternate-setting selection, and asynchronous transfer submission.

use crate::transfer::{Completion, Request, TransferCompletion};
use protocol::{
    BufferRange, Direction, EndpointInfo, EndpointType, IsoPacketDescriptor, SetupPacket, UsbError,
};

/// Transfer subsystem bound to one already-opened device
///
/// Implementations must invoke every completion passed to [`submit`] exactly
/// once, from their own execution context rather than the submitter's stack.
///
/// [`submit`]: UsbBackend::submit
pub trait UsbBackend: Send + Sync {
    /// Raw standard device descriptor (at least 18 bytes)
    fn device_descriptor_raw(&self) -> Result<Vec<u8>, UsbError>;

    /// bInterfaceNumber of every interface in the active configuration
    fn interface_numbers(&self) -> Result<Vec<u8>, UsbError>;

    /// Currently selected alternate setting of `interface`
    fn current_alt_setting(&self, interface: u8) -> Result<u8, UsbError>;

    /// Number of endpoints in the current alternate setting of `interface`
    fn endpoint_count(&self, interface: u8) -> Result<u8, UsbError>;

    /// Metadata of the `index`-th endpoint of the current alternate setting
    fn endpoint_info(&self, interface: u8, index: u8) -> Result<EndpointInfo, UsbError>;

    /// Switch `interface` to `alt_setting`
    fn select_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), UsbError>;

    /// Queue a transfer; returns immediately
    fn submit(&self, transfer: Transfer, completion: Completion);

    /// Request cancellation of every pending transfer on `endpoint`
    fn abort_endpoint(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Clear a halt/stall condition on `endpoint`
    fn reset_endpoint(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Reset `interface` as a whole
    fn reset_interface(&self, interface: u8) -> Result<(), UsbError>;

    /// Reset the device
    fn reset_device(&self) -> Result<(), UsbError>;
}

/// What kind of transfer is being submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Bulk or interrupt, as dictated by the endpoint type
    Standard,
    /// One isochronous transfer split into consecutive packets
    Isochronous { packets: Vec<IsoPacketDescriptor> },
    /// Control transfer on the default pipe
    Control {
        setup: SetupPacket,
        /// Data stage within the request buffer
        range: BufferRange,
    },
}

/// A transfer handed to the subsystem
#[derive(Debug)]
pub struct Transfer {
    pub endpoint: EndpointInfo,
    pub direction: Direction,
    pub kind: TransferKind,
    pub request: Request,
}

impl Transfer {
    /// Check the transfer is well formed for its endpoint
    ///
    /// Backends call this from their own context before touching the bus so
    /// a malformed transfer is reported through its completion.
    pub fn validate(&self) -> Result<(), UsbError> {
        match &self.kind {
            TransferKind::Standard => {
                if !matches!(
                    self.endpoint.transfer_type,
                    EndpointType::Bulk | EndpointType::Interrupt
                ) || self.direction != self.endpoint.direction()
                {
                    return Err(UsbError::InvalidParam);
                }
            }
            TransferKind::Isochronous { packets } => {
                if self.endpoint.transfer_type != EndpointType::Isochronous
                    || self.direction != self.endpoint.direction()
                {
                    return Err(UsbError::InvalidParam);
                }
                let total = packets
                    .iter()
                    .try_fold(0u64, |sum, p| sum.checked_add(p.length))
                    .ok_or(UsbError::InvalidParam)?;
                if total != self.request.buffer.len() as u64 {
                    return Err(UsbError::InvalidParam);
                }
            }
            TransferKind::Control { setup, range } => {
                if self.endpoint.transfer_type != EndpointType::Control
                    || self.direction != setup.direction()
                    || !range.fits(self.request.buffer.len())
                {
                    return Err(UsbError::InvalidParam);
                }
            }
        }
        Ok(())
    }

    /// Build the completion for this transfer
    ///
    /// On success with isochronous packets, each packet is reported as fully
    /// transferred up to `bytes`; packets past that point report zero bytes.
    pub fn into_completion(self, result: Result<usize, UsbError>) -> TransferCompletion {
        let (status, bytes) = match result {
            Ok(bytes) => (Ok(()), bytes.min(self.request.buffer.len())),
            Err(e) => (Err(e), 0),
        };

        let iso_packets = match self.kind {
            TransferKind::Isochronous { mut packets } => {
                let mut remaining = bytes as u64;
                for packet in &mut packets {
                    packet.actual_length = packet.length.min(remaining);
                    remaining -= packet.actual_length;
                    packet.status = status.clone().err();
                }
                packets
            }
            _ => Vec::new(),
        };

        TransferCompletion {
            request: self.request,
            endpoint: self.endpoint.address,
            status,
            bytes_transferred: bytes,
            iso_packets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{bulk_in, bulk_out, iso_out};
    use protocol::RequestId;

    fn transfer(
        endpoint: EndpointInfo,
        direction: Direction,
        kind: TransferKind,
        len: usize,
    ) -> Transfer {
        Transfer {
            endpoint,
            direction,
            kind,
            request: Request::with_len(RequestId(1), len),
        }
    }

    #[test]
    fn test_standard_direction_must_match() {
        assert!(transfer(bulk_in(1, 512), Direction::In, TransferKind::Standard, 64)
            .validate()
            .is_ok());
        assert_eq!(
            transfer(bulk_out(2, 512), Direction::In, TransferKind::Standard, 64).validate(),
            Err(UsbError::InvalidParam)
        );
    }

    #[test]
    fn test_standard_on_iso_endpoint_rejected() {
        assert_eq!(
            transfer(iso_out(3, 192), Direction::Out, TransferKind::Standard, 64).validate(),
            Err(UsbError::InvalidParam)
        );
    }

    #[test]
    fn test_iso_sum_must_match_buffer() {
        let kind = TransferKind::Isochronous {
            packets: IsoPacketDescriptor::layout(&[64, 64, 32]),
        };
        assert!(transfer(iso_out(3, 192), Direction::Out, kind.clone(), 160)
            .validate()
            .is_ok());
        assert_eq!(
            transfer(iso_out(3, 192), Direction::Out, kind, 128).validate(),
            Err(UsbError::InvalidParam)
        );
    }

    #[test]
    fn test_iso_sum_overflow_rejected() {
        let kind = TransferKind::Isochronous {
            packets: IsoPacketDescriptor::layout(&[u64::MAX, 1]),
        };
        assert_eq!(
            transfer(iso_out(3, 192), Direction::Out, kind, 0).validate(),
            Err(UsbError::InvalidParam)
        );
    }

    #[test]
    fn test_iso_completion_spreads_bytes() {
        let kind = TransferKind::Isochronous {
            packets: IsoPacketDescriptor::layout(&[64, 64, 32]),
        };
        let done = transfer(iso_out(3, 192), Direction::Out, kind, 160).into_completion(Ok(100));

        let actual: Vec<u64> = done.iso_packets.iter().map(|p| p.actual_length).collect();
        assert_eq!(actual, vec![64, 36, 0]);
        assert_eq!(done.bytes_transferred, 100);
    }

    #[test]
    fn test_failed_completion_reports_zero_bytes() {
        let done = transfer(bulk_in(1, 512), Direction::In, TransferKind::Standard, 64)
            .into_completion(Err(UsbError::Pipe));
        assert_eq!(done.bytes_transferred, 0);
        assert_eq!(done.status, Err(UsbError::Pipe));
        assert_eq!(done.endpoint, 0x81);
    }
}
