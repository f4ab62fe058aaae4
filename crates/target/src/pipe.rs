//! Pipe: one endpoint of the active alternate setting
//!
//! A pipe caches the endpoint metadata it was opened with and submits
//! transfers to the transfer subsystem. It never blocks on I/O.

use crate::backend::{Transfer, TransferKind, UsbBackend};
use crate::transfer::{Completion, Request};
use protocol::{Direction, EndpointInfo, IsoPacketDescriptor, UsbError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Pipe {
    device: Arc<dyn UsbBackend>,
    interface: u8,
    info: EndpointInfo,
}

impl Pipe {
    /// Open the `index`-th endpoint of `interface`'s current alternate setting
    pub fn create(device: Arc<dyn UsbBackend>, interface: u8, index: u8) -> Result<Self, UsbError> {
        let info = device.endpoint_info(interface, index)?;
        debug!("Opened pipe {} on interface {}", info, interface);

        Ok(Self {
            device,
            interface,
            info,
        })
    }

    /// Submit a bulk/interrupt IN transfer
    pub fn read_async(&self, request: Request, completion: Completion) {
        self.submit(Direction::In, TransferKind::Standard, request, completion);
    }

    /// Submit a bulk/interrupt OUT transfer
    pub fn write_async(&self, request: Request, completion: Completion) {
        self.submit(Direction::Out, TransferKind::Standard, request, completion);
    }

    /// Submit one isochronous IN transfer of `packet_sizes.len()` packets
    ///
    /// The request buffer length must equal the sum of `packet_sizes`.
    pub fn read_isochronous_async(
        &self,
        request: Request,
        packet_sizes: &[u64],
        completion: Completion,
    ) {
        self.submit_isochronous(Direction::In, request, packet_sizes, completion);
    }

    /// Submit one isochronous OUT transfer of `packet_sizes.len()` packets
    pub fn write_isochronous_async(
        &self,
        request: Request,
        packet_sizes: &[u64],
        completion: Completion,
    ) {
        self.submit_isochronous(Direction::Out, request, packet_sizes, completion);
    }

    /// Request cancellation of every pending transfer on this endpoint
    ///
    /// Returns once cancellation is requested; the cancelled transfers still
    /// complete later with [`UsbError::Cancelled`].
    pub fn abort(&self) -> Result<(), UsbError> {
        debug!("Aborting pipe {:#04x}", self.info.address);
        self.device.abort_endpoint(self.info.address)
    }

    /// Clear a halt/stall so subsequent transfers can proceed
    pub fn reset(&self) -> Result<(), UsbError> {
        debug!("Resetting pipe {:#04x}", self.info.address);
        self.device.reset_endpoint(self.info.address)
    }

    pub fn endpoint_address(&self) -> u8 {
        self.info.address
    }

    pub fn max_packet_size(&self) -> usize {
        self.info.max_packet_size as usize
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    /// bInterfaceNumber of the owning interface
    pub fn interface(&self) -> u8 {
        self.interface
    }

    fn submit_isochronous(
        &self,
        direction: Direction,
        request: Request,
        packet_sizes: &[u64],
        completion: Completion,
    ) {
        let packets = IsoPacketDescriptor::layout(packet_sizes);
        self.submit(
            direction,
            TransferKind::Isochronous { packets },
            request,
            completion,
        );
    }

    fn submit(
        &self,
        direction: Direction,
        kind: TransferKind,
        request: Request,
        completion: Completion,
    ) {
        trace!(
            "Submitting {:?} {:?} on {:#04x}, request {:?}, {} bytes",
            direction,
            kind,
            self.info.address,
            request.id,
            request.buffer.len()
        );

        self.device.submit(
            Transfer {
                endpoint: self.info,
                direction,
                kind,
                request,
            },
            completion,
        );
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("interface", &self.interface)
            .field("info", &self.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockInterface};
    use crate::transfer::oneshot_completion;
    use common::test_utils::{bulk_in, bulk_out, iso_in, next_request_id};

    fn device() -> Arc<MockBackend> {
        Arc::new(MockBackend::new(vec![MockInterface::new(
            0,
            vec![vec![bulk_in(1, 512), bulk_out(2, 64), iso_in(3, 192)]],
        )]))
    }

    #[test]
    fn test_create_caches_metadata() {
        let device = device();
        let pipe = Pipe::create(device, 0, 1).unwrap();

        assert_eq!(pipe.endpoint_address(), 0x02);
        assert_eq!(pipe.max_packet_size(), 64);
        assert_eq!(pipe.interface(), 0);
    }

    #[test]
    fn test_create_out_of_range_fails() {
        assert_eq!(Pipe::create(device(), 0, 7).unwrap_err(), UsbError::NotFound);
    }

    #[test]
    fn test_read_async_completes() {
        let device = device();
        let pipe = Pipe::create(device.clone(), 0, 0).unwrap();
        let (completion, rx) = oneshot_completion();

        pipe.read_async(Request::with_len(next_request_id(), 100), completion);

        let done = rx.blocking_wait().unwrap();
        assert!(done.is_success());
        assert!(done.bytes_transferred <= 100);
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn test_read_on_out_pipe_fails_through_completion() {
        let pipe = Pipe::create(device(), 0, 1).unwrap();
        let (completion, rx) = oneshot_completion();

        pipe.read_async(Request::with_len(next_request_id(), 8), completion);

        assert_eq!(rx.blocking_wait().unwrap().status, Err(UsbError::InvalidParam));
    }

    #[test]
    fn test_isochronous_layout_reaches_backend() {
        let device = device();
        let pipe = Pipe::create(device.clone(), 0, 2).unwrap();
        let (completion, rx) = oneshot_completion();

        let request = Request::with_len(next_request_id(), 96);
        pipe.read_isochronous_async(request, &[32, 32, 32], completion);

        let done = rx.blocking_wait().unwrap();
        assert!(done.is_success());
        assert_eq!(done.iso_packets.len(), 3);
        assert_eq!(done.iso_packets[2].offset, 64);
    }

    #[test]
    fn test_abort_and_reset_reach_backend() {
        let device = device();
        let pipe = Pipe::create(device.clone(), 0, 0).unwrap();

        pipe.abort().unwrap();
        pipe.reset().unwrap();

        assert_eq!(device.abort_count(0x81), 1);
        assert_eq!(device.reset_count(0x81), 1);
    }
}
