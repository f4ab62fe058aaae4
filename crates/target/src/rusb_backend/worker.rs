//! Transfer worker threads
//!
//! libusb's synchronous calls block, so transfers run on a small pool of
//! dedicated threads fed by an async-channel queue. Each worker calls the
//! transfer's completion itself once the transfer finishes.

use super::RusbSettings;
use super::device::UsbDevice;
use super::transfers::execute_transfer;
use crate::backend::Transfer;
use crate::transfer::Completion;
use protocol::UsbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Work item: a transfer plus the abort epoch of its endpoint at submission
pub struct Job {
    pub transfer: Transfer,
    pub completion: Completion,
    pub epoch: u64,
}

/// Per-endpoint abort counters
///
/// An abort bumps the endpoint's epoch; any job submitted under an older
/// epoch is cancelled at its next check.
#[derive(Debug, Default)]
pub struct AbortEpochs {
    epochs: [AtomicU64; 32],
}

impl AbortEpochs {
    pub fn current(&self, endpoint: u8) -> u64 {
        self.epochs[slot(endpoint)].load(Ordering::Acquire)
    }

    pub fn bump(&self, endpoint: u8) {
        self.epochs[slot(endpoint)].fetch_add(1, Ordering::AcqRel);
    }

    pub fn bump_all(&self) {
        for epoch in &self.epochs {
            epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn is_aborted(&self, endpoint: u8, epoch: u64) -> bool {
        self.current(endpoint) != epoch
    }
}

/// Endpoint number in the low nibble, direction in bit 4
fn slot(endpoint: u8) -> usize {
    ((endpoint & 0x0f) | ((endpoint & 0x80) >> 3)) as usize
}

/// State shared by the backend and its workers
pub struct Shared {
    pub device: UsbDevice,
    pub settings: RusbSettings,
    pub aborts: AbortEpochs,
}

/// Spawn `count` workers draining `jobs` until the channel closes
pub fn spawn_transfer_workers(
    count: usize,
    shared: Arc<Shared>,
    jobs: async_channel::Receiver<Job>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..count.max(1))
        .map(|index| {
            let shared = shared.clone();
            let jobs = jobs.clone();
            std::thread::Builder::new()
                .name(format!("usb-transfer-{}", index))
                .spawn(move || run(index, &shared, &jobs))
        })
        .collect()
}

fn run(index: usize, shared: &Shared, jobs: &async_channel::Receiver<Job>) {
    debug!("Transfer worker {} started", index);

    while let Ok(job) = jobs.recv_blocking() {
        handle_job(shared, job);
    }

    info!("Transfer worker {} stopped", index);
}

/// Execute one job and deliver its completion exactly once
fn handle_job(shared: &Shared, job: Job) {
    let Job {
        mut transfer,
        completion,
        epoch,
    } = job;
    let endpoint = transfer.endpoint.address;

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let cancel = || shared.aborts.is_aborted(endpoint, epoch);
        execute_transfer(&shared.device, &shared.settings, &mut transfer, &cancel)
    }))
    .unwrap_or_else(|e| {
        error!("Panic while executing transfer on {:#04x}: {:?}", endpoint, e);
        Err(UsbError::Other {
            message: "transfer handler panicked".to_string(),
        })
    });

    completion(transfer.into_completion(result));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_distinct_per_direction() {
        assert_eq!(slot(0x00), 0);
        assert_eq!(slot(0x01), 1);
        assert_eq!(slot(0x81), 17);
        assert_eq!(slot(0x8f), 31);
        assert_ne!(slot(0x02), slot(0x82));
    }

    #[test]
    fn test_abort_invalidates_older_epochs() {
        let aborts = AbortEpochs::default();
        let before = aborts.current(0x81);

        aborts.bump(0x81);

        assert!(aborts.is_aborted(0x81, before));
        assert!(!aborts.is_aborted(0x81, aborts.current(0x81)));
        assert!(!aborts.is_aborted(0x01, aborts.current(0x01)));
    }

    #[test]
    fn test_bump_all_cancels_every_endpoint() {
        let aborts = AbortEpochs::default();
        let (a, b) = (aborts.current(0x02), aborts.current(0x83));

        aborts.bump_all();

        assert!(aborts.is_aborted(0x02, a));
        assert!(aborts.is_aborted(0x83, b));
    }
}
