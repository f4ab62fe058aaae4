//! Transfer subsystem backed by libusb (via rusb)
//!
//! [`RusbBackend`] owns an opened, claimed device and a pool of worker
//! threads. Submission only enqueues; the workers run the synchronous rusb
//! calls and invoke completions from their own threads.
//!
//! Isochronous transfers are accepted for topology purposes but complete with
//! [`UsbError::NotSupported`]: rusb exposes no synchronous isochronous API.

mod device;
mod transfers;
mod worker;

pub use device::{InterfaceLayout, UsbDevice};
pub use transfers::map_rusb_error;

use crate::backend::{Transfer, UsbBackend};
use crate::transfer::Completion;
use protocol::{EndpointInfo, UsbError};
use rusb::Context;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use worker::{AbortEpochs, Job, Shared, spawn_transfer_workers};

/// Runtime settings of [`RusbBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RusbSettings {
    /// Transfer worker threads
    pub workers: usize,
    /// Per-attempt timeout of an IN transfer; bounds abort latency
    pub poll_slice: Duration,
    /// Timeout of a control transfer
    pub control_timeout: Duration,
    /// Timeout of a bulk/interrupt OUT transfer
    pub write_timeout: Duration,
}

impl Default for RusbSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_slice: Duration::from_millis(100),
            control_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

pub struct RusbBackend {
    shared: Arc<Shared>,
    jobs: async_channel::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl RusbBackend {
    /// Open the first device matching `vendor_id:product_id`
    pub fn open(vendor_id: u16, product_id: u16, settings: RusbSettings) -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        let device = UsbDevice::open_by_id(&context, vendor_id, product_id)?;
        Self::with_device(device, settings)
    }

    /// Start the worker pool around an already opened device
    pub fn with_device(device: UsbDevice, settings: RusbSettings) -> Result<Self, UsbError> {
        let (tx, rx) = async_channel::unbounded();
        let workers = settings.workers;

        let shared = Arc::new(Shared {
            device,
            settings,
            aborts: AbortEpochs::default(),
        });

        let workers = spawn_transfer_workers(workers, shared.clone(), rx).map_err(|e| {
            UsbError::Other {
                message: format!("failed to spawn transfer workers: {}", e),
            }
        })?;

        info!("USB backend started with {} transfer workers", workers.len());

        Ok(Self {
            shared,
            jobs: tx,
            workers,
        })
    }

    pub fn settings(&self) -> &RusbSettings {
        &self.shared.settings
    }

    /// Endpoint layout of every interface, all alternate settings included
    pub fn layout(&self) -> &[InterfaceLayout] {
        self.shared.device.layout()
    }
}

impl UsbBackend for RusbBackend {
    fn device_descriptor_raw(&self) -> Result<Vec<u8>, UsbError> {
        Ok(self.shared.device.descriptor().to_vec())
    }

    fn interface_numbers(&self) -> Result<Vec<u8>, UsbError> {
        Ok(self.layout().iter().map(|iface| iface.number).collect())
    }

    fn current_alt_setting(&self, interface: u8) -> Result<u8, UsbError> {
        self.shared.device.current_alt_setting(interface)
    }

    fn endpoint_count(&self, interface: u8) -> Result<u8, UsbError> {
        Ok(self.shared.device.current_endpoints(interface)?.len() as u8)
    }

    fn endpoint_info(&self, interface: u8, index: u8) -> Result<EndpointInfo, UsbError> {
        self.shared
            .device
            .current_endpoints(interface)?
            .get(index as usize)
            .copied()
            .ok_or(UsbError::NotFound)
    }

    fn select_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        self.shared.device.set_alt_setting(interface, alt_setting)
    }

    fn submit(&self, transfer: Transfer, completion: Completion) {
        let epoch = self.shared.aborts.current(transfer.endpoint.address);
        let job = Job {
            transfer,
            completion,
            epoch,
        };

        if let Err(e) = self.jobs.send_blocking(job) {
            let job = e.into_inner();
            warn!(
                "Transfer queue closed, failing transfer on {:#04x}",
                job.transfer.endpoint.address
            );
            // Workers are gone; hand the completion to a fresh thread so it
            // still never runs on the submitter's stack
            let spawned = std::thread::Builder::new()
                .name("usb-transfer-drain".to_string())
                .spawn(move || {
                    (job.completion)(job.transfer.into_completion(Err(UsbError::NoDevice)))
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn completion thread: {}", e);
            }
        }
    }

    fn abort_endpoint(&self, endpoint: u8) -> Result<(), UsbError> {
        debug!("Abort requested on {:#04x}", endpoint);
        self.shared.aborts.bump(endpoint);
        Ok(())
    }

    fn reset_endpoint(&self, endpoint: u8) -> Result<(), UsbError> {
        self.shared.device.clear_halt(endpoint)
    }

    fn reset_interface(&self, interface: u8) -> Result<(), UsbError> {
        let alt = self.shared.device.current_alt_setting(interface)?;
        for endpoint in self.shared.device.current_endpoints(interface)? {
            self.shared.aborts.bump(endpoint.address);
        }
        self.shared.device.set_alt_setting(interface, alt)
    }

    fn reset_device(&self) -> Result<(), UsbError> {
        self.shared.aborts.bump_all();
        self.shared.device.reset()
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        // Cancel in-flight reads so every worker notices the closed queue
        self.shared.aborts.bump_all();
        self.jobs.close();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
        debug!("USB backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RusbSettings::default();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.poll_slice, Duration::from_millis(100));
        assert!(settings.control_timeout > settings.poll_slice);
    }

    #[test]
    fn test_open_missing_device() {
        // Without USB access or a matching device this fails cleanly
        match RusbBackend::open(0xffff, 0xfffe, RusbSettings::default()) {
            Ok(_) => panic!("unexpected device 0xffff:0xfffe"),
            Err(e) => eprintln!("open failed as expected: {}", e),
        }
    }
}
