//! Target: device-level façade over the interface topology
//!
//! Routes every pipe operation by endpoint address to the interface whose
//! current pipe set contains it. The interface list is fixed at creation;
//! only the pipe sets inside it change.

use crate::backend::{Transfer, TransferKind, UsbBackend};
use crate::interface::Interface;
use crate::lock::LockPolicy;
use crate::pipe::Pipe;
use crate::transfer::{Completion, Rejected, Request};
use protocol::{
    BufferRange, CONTROL_ENDPOINT, DeviceDescriptor, EndpointInfo, EndpointType, SetupPacket,
    UsbError,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One interface and the endpoints of its active alternate setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceTopology {
    pub number: u8,
    pub alt_setting: u8,
    pub endpoints: Vec<EndpointInfo>,
}

pub struct Target {
    device: Arc<dyn UsbBackend>,
    descriptor: DeviceDescriptor,
    interfaces: Vec<Interface>,
}

impl Target {
    /// Read the device descriptor and build every interface of the active
    /// configuration
    pub fn create(device: Arc<dyn UsbBackend>) -> Result<Self, UsbError> {
        let raw = device.device_descriptor_raw()?;
        let descriptor = DeviceDescriptor::parse(&raw).map_err(|e| UsbError::Other {
            message: format!("invalid device descriptor: {}", e),
        })?;

        let interfaces = device
            .interface_numbers()?
            .into_iter()
            .map(|number| Interface::create(device.clone(), number))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Target {:04x}:{:04x} created with {} interfaces",
            descriptor.vendor_id,
            descriptor.product_id,
            interfaces.len()
        );

        Ok(Self {
            device,
            descriptor,
            interfaces,
        })
    }

    /// Cached device descriptor
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Switch interface `interface_index` to `alt_setting`
    pub fn set_interface_alt_setting(
        &self,
        interface_index: usize,
        alt_setting: u8,
    ) -> Result<(), UsbError> {
        self.interface(interface_index)?.set_alt_setting(alt_setting)
    }

    /// Reset interface `interface_index` as a whole
    pub fn reset_interface(&self, interface_index: usize) -> Result<(), UsbError> {
        self.interface(interface_index)?.reset()
    }

    pub fn write_pipe_async(
        &self,
        endpoint: u8,
        request: Request,
        completion: Completion,
    ) -> Result<(), Rejected> {
        self.do_pipe_operation(endpoint, (request, completion), |pipe, (request, completion)| {
            pipe.write_async(request, completion)
        })
        .map_err(|(request, _)| not_found(endpoint, request))
    }

    pub fn read_pipe_async(
        &self,
        endpoint: u8,
        request: Request,
        completion: Completion,
    ) -> Result<(), Rejected> {
        self.do_pipe_operation(endpoint, (request, completion), |pipe, (request, completion)| {
            pipe.read_async(request, completion)
        })
        .map_err(|(request, _)| not_found(endpoint, request))
    }

    pub fn read_isochronous_pipe_async(
        &self,
        endpoint: u8,
        request: Request,
        packet_sizes: &[u64],
        completion: Completion,
    ) -> Result<(), Rejected> {
        self.do_pipe_operation(endpoint, (request, completion), |pipe, (request, completion)| {
            pipe.read_isochronous_async(request, packet_sizes, completion)
        })
        .map_err(|(request, _)| not_found(endpoint, request))
    }

    pub fn write_isochronous_pipe_async(
        &self,
        endpoint: u8,
        request: Request,
        packet_sizes: &[u64],
        completion: Completion,
    ) -> Result<(), Rejected> {
        self.do_pipe_operation(endpoint, (request, completion), |pipe, (request, completion)| {
            pipe.write_isochronous_async(request, packet_sizes, completion)
        })
        .map_err(|(request, _)| not_found(endpoint, request))
    }

    /// Submit a control transfer on the default pipe
    ///
    /// `range` selects the data stage within the request buffer; the
    /// direction comes from the setup packet.
    pub fn control_transfer_async(
        &self,
        request: Request,
        setup: SetupPacket,
        range: BufferRange,
        completion: Completion,
    ) -> Result<(), Rejected> {
        if !range.fits(request.buffer.len()) {
            warn!(
                "Control transfer range {:?} outside {}-byte buffer",
                range,
                request.buffer.len()
            );
            return Err(Rejected {
                endpoint: CONTROL_ENDPOINT,
                error: UsbError::InvalidParam,
                request,
            });
        }

        debug!(
            "Control transfer: type={:#x} request={:#x} value={:#x} index={:#x} length={}",
            setup.request_type, setup.request, setup.value, setup.index, setup.length
        );

        self.device.submit(
            Transfer {
                endpoint: self.control_endpoint(),
                direction: setup.direction(),
                kind: TransferKind::Control { setup, range },
                request,
            },
            completion,
        );
        Ok(())
    }

    /// Request cancellation of every pending transfer on `endpoint`
    pub fn abort_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        self.do_pipe_operation(endpoint, (), |pipe, ()| pipe.abort())
            .unwrap_or(Err(UsbError::NotFound))
    }

    /// Clear a halt/stall on `endpoint`
    pub fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        self.do_pipe_operation(endpoint, (), |pipe, ()| pipe.reset())
            .unwrap_or(Err(UsbError::NotFound))
    }

    pub fn reset_device(&self) -> Result<(), UsbError> {
        info!(
            "Resetting device {:04x}:{:04x}",
            self.descriptor.vendor_id, self.descriptor.product_id
        );
        self.device.reset_device()
    }

    pub fn pipe_max_packet_size(&self, endpoint: u8) -> Result<usize, UsbError> {
        self.do_pipe_operation(endpoint, (), |pipe, ()| pipe.max_packet_size())
            .map_err(|()| UsbError::NotFound)
    }

    /// Metadata of the pipe currently bound to `endpoint`
    pub fn pipe_info(&self, endpoint: u8) -> Result<EndpointInfo, UsbError> {
        self.do_pipe_operation(endpoint, (), |pipe, ()| *pipe.info())
            .map_err(|()| UsbError::NotFound)
    }

    /// Snapshot of every interface and its current pipes
    pub fn topology(&self) -> Vec<InterfaceTopology> {
        self.interfaces
            .iter()
            .map(|iface| {
                let (alt_setting, endpoints) = iface.snapshot();
                InterfaceTopology {
                    number: iface.number(),
                    alt_setting,
                    endpoints,
                }
            })
            .collect()
    }

    fn interface(&self, index: usize) -> Result<&Interface, UsbError> {
        self.interfaces.get(index).ok_or_else(|| {
            warn!(
                "Interface index {} out of range ({} interfaces)",
                index,
                self.interfaces.len()
            );
            UsbError::InvalidParam
        })
    }

    fn control_endpoint(&self) -> EndpointInfo {
        EndpointInfo::new(
            CONTROL_ENDPOINT,
            EndpointType::Control,
            self.descriptor.max_packet_size_0 as u16,
        )
    }

    /// Ask every interface in turn until one owns `endpoint`
    fn do_pipe_operation<T, R, F>(&self, endpoint: u8, input: T, op: F) -> Result<R, T>
    where
        F: Fn(&Pipe, T) -> R,
    {
        let mut input = input;
        for iface in &self.interfaces {
            match iface.do_pipe_operation(LockPolicy::Shared, endpoint, input, &op) {
                Ok(result) => return Ok(result),
                Err(back) => input = back,
            }
        }

        trace_pipe_not_found(endpoint);
        Err(input)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("descriptor", &self.descriptor)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

fn not_found(endpoint: u8, request: Request) -> Rejected {
    Rejected {
        endpoint,
        error: UsbError::NotFound,
        request,
    }
}

fn trace_pipe_not_found(endpoint: u8) {
    warn!("Pipe {:#04x} not found in any interface", endpoint);
}
