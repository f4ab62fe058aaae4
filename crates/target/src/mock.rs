//! Scriptable in-memory transfer subsystem
//!
//! Describes a device as a list of interfaces, each with its alternate
//! settings, and completes transfers from its own delivery thread. In
//! [`CompletionMode::Manual`] transfers stay pending until the test completes
//! or aborts them, which makes in-flight behaviour observable.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use common::test_utils::{bulk_in, bulk_out};
//! use usb_target::mock::{MockBackend, MockInterface};
//! use usb_target::Target;
//!
//! let device = Arc::new(MockBackend::new(vec![MockInterface::new(
//!     0,
//!     vec![vec![bulk_in(1, 512), bulk_out(2, 512)]],
//! )]));
//! let target = Target::create(device).unwrap();
//! assert_eq!(target.pipe_max_packet_size(0x81), Ok(512));
//! ```

use crate::backend::{Transfer, TransferKind, UsbBackend};
use crate::transfer::Completion;
use common::test_utils::{create_mock_bulk_data, create_mock_device_descriptor};
use protocol::{Direction, EndpointInfo, RequestId, SetupPacket, UsbError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// One interface and the endpoints of each of its alternate settings
#[derive(Debug, Clone)]
pub struct MockInterface {
    pub number: u8,
    pub alt_settings: Vec<Vec<EndpointInfo>>,
}

impl MockInterface {
    pub fn new(number: u8, alt_settings: Vec<Vec<EndpointInfo>>) -> Self {
        Self {
            number,
            alt_settings,
        }
    }
}

/// When submitted transfers complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// As soon as the delivery thread picks them up
    Immediate,
    /// Only on `complete_pending`/`complete_endpoint` or an abort
    Manual,
}

/// Record of one `submit` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub request_id: RequestId,
    pub len: usize,
}

struct Delivery {
    transfer: Transfer,
    completion: Completion,
    result: Result<usize, UsbError>,
}

struct MockState {
    interfaces: Vec<(MockInterface, u8)>,
    mode: CompletionMode,
    pending: Vec<(Transfer, Completion)>,
    submissions: Vec<Submission>,
    aborts: HashMap<u8, usize>,
    resets: HashMap<u8, usize>,
    interface_resets: HashMap<u8, usize>,
    device_resets: usize,
    stalled: HashSet<u8>,
    alt_switch_delay: Duration,
    alt_switch_gate: Option<Arc<Barrier>>,
    endpoint_info_error: Option<UsbError>,
    max_iso_packets: Option<usize>,
}

impl MockState {
    fn interface(&self, number: u8) -> Result<&(MockInterface, u8), UsbError> {
        self.interfaces
            .iter()
            .find(|(iface, _)| iface.number == number)
            .ok_or(UsbError::NotFound)
    }

    fn current_endpoints(&self, number: u8) -> Result<&[EndpointInfo], UsbError> {
        let (iface, current) = self.interface(number)?;
        iface
            .alt_settings
            .get(*current as usize)
            .map(Vec::as_slice)
            .ok_or(UsbError::NotFound)
    }
}

pub struct MockBackend {
    descriptor: Vec<u8>,
    state: Mutex<MockState>,
    deliveries: async_channel::Sender<Delivery>,
    worker: Option<JoinHandle<()>>,
}

impl MockBackend {
    /// Device with the given interfaces, all on alternate setting 0
    pub fn new(interfaces: Vec<MockInterface>) -> Self {
        let (tx, rx) = async_channel::unbounded::<Delivery>();

        let worker = std::thread::Builder::new()
            .name("mock-usb".to_string())
            .spawn(move || {
                while let Ok(delivery) = rx.recv_blocking() {
                    let done = delivery.transfer.into_completion(delivery.result);
                    (delivery.completion)(done);
                }
            })
            .ok();

        Self {
            descriptor: create_mock_device_descriptor(),
            state: Mutex::new(MockState {
                interfaces: interfaces.into_iter().map(|iface| (iface, 0)).collect(),
                mode: CompletionMode::Immediate,
                pending: Vec::new(),
                submissions: Vec::new(),
                aborts: HashMap::new(),
                resets: HashMap::new(),
                interface_resets: HashMap::new(),
                device_resets: 0,
                stalled: HashSet::new(),
                alt_switch_delay: Duration::ZERO,
                alt_switch_gate: None,
                endpoint_info_error: None,
                max_iso_packets: None,
            }),
            deliveries: tx,
            worker,
        }
    }

    /// Replace the raw device descriptor
    pub fn with_descriptor(mut self, raw: Vec<u8>) -> Self {
        self.descriptor = raw;
        self
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state().mode = mode;
    }

    /// Sleep this long inside `select_alt_setting`
    pub fn set_alt_switch_delay(&self, delay: Duration) {
        self.state().alt_switch_delay = delay;
    }

    /// Wait on `gate` once a valid switch has started, before the delay
    pub fn set_alt_switch_gate(&self, gate: Arc<Barrier>) {
        self.state().alt_switch_gate = Some(gate);
    }

    /// Fail every `endpoint_info` query with `error` until cleared
    pub fn set_endpoint_info_error(&self, error: Option<UsbError>) {
        self.state().endpoint_info_error = error;
    }

    /// Fail isochronous transfers with more packets than `limit`
    pub fn set_max_iso_packets(&self, limit: usize) {
        self.state().max_iso_packets = Some(limit);
    }

    /// Make transfers on `endpoint` fail with a stall until it is reset
    pub fn stall_endpoint(&self, endpoint: u8) {
        self.state().stalled.insert(endpoint);
    }

    /// Change an interface's setting without going through the topology
    pub fn force_alt_setting(&self, interface: u8, alt_setting: u8) {
        let mut state = self.state();
        if let Some((_, current)) = state
            .interfaces
            .iter_mut()
            .find(|(iface, _)| iface.number == interface)
        {
            *current = alt_setting;
        }
    }

    /// Complete every pending transfer; returns how many
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.state().pending);
        self.finish_all(pending)
    }

    /// Complete pending transfers on `endpoint`; returns how many
    pub fn complete_endpoint(&self, endpoint: u8) -> usize {
        let matching = self.take_pending(endpoint);
        self.finish_all(matching)
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.state().interface(interface).ok().map(|(_, alt)| *alt)
    }

    pub fn abort_count(&self, endpoint: u8) -> usize {
        self.state().aborts.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn reset_count(&self, endpoint: u8) -> usize {
        self.state().resets.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn interface_reset_count(&self, interface: u8) -> usize {
        self.state()
            .interface_resets
            .get(&interface)
            .copied()
            .unwrap_or(0)
    }

    pub fn device_reset_count(&self) -> usize {
        self.state().device_resets
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, endpoint: u8) -> Vec<(Transfer, Completion)> {
        let mut state = self.state();
        let (matching, kept) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|(t, _)| t.endpoint.address == endpoint);
        state.pending = kept;
        matching
    }

    fn finish_all(&self, transfers: Vec<(Transfer, Completion)>) -> usize {
        let count = transfers.len();
        for (mut transfer, completion) in transfers {
            let result = self.execute(&mut transfer);
            self.deliver(transfer, completion, result);
        }
        count
    }

    /// Move the data: fill IN buffers, count OUT bytes
    fn execute(&self, transfer: &mut Transfer) -> Result<usize, UsbError> {
        transfer.validate()?;

        {
            let state = self.state();
            if state.stalled.contains(&transfer.endpoint.address) {
                return Err(UsbError::Pipe);
            }
            if let (TransferKind::Isochronous { packets }, Some(limit)) =
                (&transfer.kind, state.max_iso_packets)
                && packets.len() > limit
            {
                return Err(UsbError::InvalidParam);
            }
        }

        let (start, len) = match &transfer.kind {
            TransferKind::Control { range, .. } => (range.offset, range.length),
            _ => (0, transfer.request.buffer.len()),
        };

        if transfer.direction == Direction::In {
            let fill = match &transfer.kind {
                TransferKind::Control { setup, .. }
                    if *setup == SetupPacket::get_device_descriptor() =>
                {
                    self.descriptor.clone()
                }
                _ => create_mock_bulk_data(len),
            };
            let n = fill.len().min(len);
            transfer.request.buffer[start..start + n].copy_from_slice(&fill[..n]);
            return Ok(n);
        }
        Ok(len)
    }

    fn deliver(&self, transfer: Transfer, completion: Completion, result: Result<usize, UsbError>) {
        if let Err(e) = self.deliveries.send_blocking(Delivery {
            transfer,
            completion,
            result,
        }) {
            // Delivery thread gone; complete on this thread rather than never
            let delivery = e.into_inner();
            (delivery.completion)(delivery.transfer.into_completion(Err(UsbError::NoDevice)));
        }
    }
}

impl UsbBackend for MockBackend {
    fn device_descriptor_raw(&self) -> Result<Vec<u8>, UsbError> {
        Ok(self.descriptor.clone())
    }

    fn interface_numbers(&self) -> Result<Vec<u8>, UsbError> {
        Ok(self
            .state()
            .interfaces
            .iter()
            .map(|(iface, _)| iface.number)
            .collect())
    }

    fn current_alt_setting(&self, interface: u8) -> Result<u8, UsbError> {
        self.state().interface(interface).map(|(_, alt)| *alt)
    }

    fn endpoint_count(&self, interface: u8) -> Result<u8, UsbError> {
        Ok(self.state().current_endpoints(interface)?.len() as u8)
    }

    fn endpoint_info(&self, interface: u8, index: u8) -> Result<EndpointInfo, UsbError> {
        let state = self.state();
        if let Some(error) = &state.endpoint_info_error {
            return Err(error.clone());
        }
        state
            .current_endpoints(interface)?
            .get(index as usize)
            .copied()
            .ok_or(UsbError::NotFound)
    }

    fn select_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        let (gate, delay) = {
            let state = self.state();
            let (iface, _) = state.interface(interface)?;
            if alt_setting as usize >= iface.alt_settings.len() {
                return Err(UsbError::InvalidParam);
            }
            (state.alt_switch_gate.clone(), state.alt_switch_delay)
        };

        if let Some(gate) = gate {
            gate.wait();
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        debug!("Mock interface {} -> alt setting {}", interface, alt_setting);
        self.force_alt_setting(interface, alt_setting);
        Ok(())
    }

    fn submit(&self, mut transfer: Transfer, completion: Completion) {
        {
            let mut state = self.state();
            state.submissions.push(Submission {
                endpoint: transfer.endpoint.address,
                direction: transfer.direction,
                kind: transfer.kind.clone(),
                request_id: transfer.request.id,
                len: transfer.request.buffer.len(),
            });
            if state.mode == CompletionMode::Manual && transfer.validate().is_ok() {
                state.pending.push((transfer, completion));
                return;
            }
        }

        let result = self.execute(&mut transfer);
        self.deliver(transfer, completion, result);
    }

    fn abort_endpoint(&self, endpoint: u8) -> Result<(), UsbError> {
        *self.state().aborts.entry(endpoint).or_default() += 1;

        for (transfer, completion) in self.take_pending(endpoint) {
            self.deliver(transfer, completion, Err(UsbError::Cancelled));
        }
        Ok(())
    }

    fn reset_endpoint(&self, endpoint: u8) -> Result<(), UsbError> {
        let mut state = self.state();
        *state.resets.entry(endpoint).or_default() += 1;
        state.stalled.remove(&endpoint);
        Ok(())
    }

    fn reset_interface(&self, interface: u8) -> Result<(), UsbError> {
        let mut state = self.state();
        state.interface(interface)?;
        *state.interface_resets.entry(interface).or_default() += 1;
        Ok(())
    }

    fn reset_device(&self) -> Result<(), UsbError> {
        self.state().device_resets += 1;
        Ok(())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut self.state().pending);
        for (transfer, completion) in pending {
            self.deliver(transfer, completion, Err(UsbError::NoDevice));
        }

        self.deliveries.close();
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != std::thread::current().id()
        {
            let _ = worker.join();
        }
    }
}
