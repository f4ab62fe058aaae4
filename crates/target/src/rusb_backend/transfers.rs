//! Transfer execution
//!
//! Runs one transfer to completion with rusb's synchronous API. IN transfers
//! wait in poll slices so an abort is noticed between attempts.

use super::RusbSettings;
use super::device::UsbDevice;
use crate::backend::{Transfer, TransferKind};
use protocol::{BufferRange, Direction, EndpointType, SetupPacket, UsbError};
use tracing::{debug, trace, warn};

/// Abort check consulted before and between attempts
pub trait CancelCheck {
    fn is_cancelled(&self) -> bool;
}

impl<F: Fn() -> bool> CancelCheck for F {
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Execute `transfer`, returning the number of bytes moved
pub fn execute_transfer(
    device: &UsbDevice,
    settings: &RusbSettings,
    transfer: &mut Transfer,
    cancel: &impl CancelCheck,
) -> Result<usize, UsbError> {
    transfer.validate()?;

    if cancel.is_cancelled() {
        return Err(UsbError::Cancelled);
    }

    let result = match &transfer.kind {
        TransferKind::Isochronous { .. } => Err(UsbError::NotSupported),
        TransferKind::Control { setup, range } => {
            let (setup, range) = (*setup, *range);
            execute_control_transfer(device, settings, setup, range, &mut transfer.request.buffer)
        }
        TransferKind::Standard => execute_stream_transfer(
            device,
            settings,
            transfer.endpoint.address,
            transfer.endpoint.transfer_type,
            transfer.direction,
            &mut transfer.request.buffer,
            cancel,
        ),
    };

    match &result {
        Ok(bytes) => debug!(
            "Transfer on {:#04x} succeeded: {} bytes",
            transfer.endpoint.address, bytes
        ),
        Err(UsbError::Cancelled) => {
            debug!("Transfer on {:#04x} cancelled", transfer.endpoint.address)
        }
        Err(e) => warn!("Transfer on {:#04x} failed: {}", transfer.endpoint.address, e),
    }
    result
}

/// Control transfer on the default pipe; the data stage is `range` of `buffer`
fn execute_control_transfer(
    device: &UsbDevice,
    settings: &RusbSettings,
    setup: SetupPacket,
    range: BufferRange,
    buffer: &mut [u8],
) -> Result<usize, UsbError> {
    debug!(
        "Control transfer: type={:#x} request={:#x} value={:#x} index={:#x} data_len={}",
        setup.request_type, setup.request, setup.value, setup.index, range.length
    );

    let data = &mut buffer[range.offset..range.offset + range.length];
    let handle = device.handle();

    match setup.direction() {
        Direction::In => handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            settings.control_timeout,
        ),
        Direction::Out => handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            settings.control_timeout,
        ),
    }
    .map_err(map_rusb_error)
}

/// Bulk or interrupt transfer
///
/// IN waits until data arrives or the endpoint is aborted. OUT is a single
/// attempt bounded by the write timeout, since a timed-out write may have
/// partially reached the device.
fn execute_stream_transfer(
    device: &UsbDevice,
    settings: &RusbSettings,
    endpoint: u8,
    transfer_type: EndpointType,
    direction: Direction,
    buffer: &mut [u8],
    cancel: &impl CancelCheck,
) -> Result<usize, UsbError> {
    let interrupt = transfer_type == EndpointType::Interrupt;

    if direction == Direction::Out {
        let handle = device.handle();
        let written = if interrupt {
            handle.write_interrupt(endpoint, buffer, settings.write_timeout)
        } else {
            handle.write_bulk(endpoint, buffer, settings.write_timeout)
        };
        return written.map_err(map_rusb_error);
    }

    loop {
        if cancel.is_cancelled() {
            return Err(UsbError::Cancelled);
        }

        let read = {
            let handle = device.handle();
            if interrupt {
                handle.read_interrupt(endpoint, buffer, settings.poll_slice)
            } else {
                handle.read_bulk(endpoint, buffer, settings.poll_slice)
            }
        };

        match read {
            Ok(len) => return Ok(len),
            Err(rusb::Error::Timeout) => {
                trace!("No data on {:#04x} yet", endpoint);
            }
            Err(e) => return Err(map_rusb_error(e)),
        }
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::Interrupted => UsbError::Cancelled,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), UsbError::NotFound);
        assert_eq!(
            map_rusb_error(rusb::Error::NotSupported),
            UsbError::NotSupported
        );
    }

    #[test]
    fn test_unmapped_error_keeps_message() {
        match map_rusb_error(rusb::Error::NoMem) {
            UsbError::Other { message } => assert!(!message.is_empty()),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_closure_cancel_check() {
        let never = || false;
        let always = || true;
        assert!(!never.is_cancelled());
        assert!(always.is_cancelled());
    }
}
