//! Interface: the pipes of one USB interface's active alternate setting
//!
//! The pipe set is the only mutable shared structure in the topology. Lookups
//! take its lock shared; an alternate-setting switch takes it exclusive and
//! replaces the whole set, so no lookup ever sees a partially rebuilt set.

use crate::backend::UsbBackend;
use crate::lock::{LockPolicy, PolicyLock};
use crate::pipe::Pipe;
use protocol::{EndpointInfo, UsbError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pipes of the active alternate setting
#[derive(Debug, Default)]
pub struct PipeSet {
    pub alt_setting: u8,
    pub pipes: Vec<Pipe>,
}

pub struct Interface {
    device: Arc<dyn UsbBackend>,
    number: u8,
    pipes: PolicyLock<PipeSet>,
}

impl Interface {
    /// Build the pipe set from the interface's current alternate setting
    pub fn create(device: Arc<dyn UsbBackend>, number: u8) -> Result<Self, UsbError> {
        let alt_setting = device.current_alt_setting(number)?;
        let pipes = build_pipes(&device, number)?;

        debug!(
            "Interface {} created with alt setting {} and {} pipes",
            number,
            alt_setting,
            pipes.len()
        );

        Ok(Self {
            device,
            number,
            pipes: PolicyLock::new(PipeSet { alt_setting, pipes }),
        })
    }

    /// Switch the active alternate setting
    ///
    /// Waits for every in-flight lookup on this interface, then blocks new
    /// ones until the pipe set has been rebuilt. Pipes of the previous setting
    /// are dropped. If the subsystem rejects the switch, the pipe set is
    /// rebuilt from whatever setting it reports as active and the rejection is
    /// returned.
    pub fn set_alt_setting(&self, alt_setting: u8) -> Result<(), UsbError> {
        let mut set = self.pipes.write();
        set.pipes.clear();

        let selected = self.device.select_alt_setting(self.number, alt_setting);
        if let Err(ref e) = selected {
            warn!(
                "Interface {}: switch to alt setting {} failed: {}",
                self.number, alt_setting, e
            );
        }

        let active = match selected {
            Ok(()) => alt_setting,
            Err(_) => self
                .device
                .current_alt_setting(self.number)
                .unwrap_or(set.alt_setting),
        };

        let rebuilt = build_pipes(&self.device, self.number);
        let result = match rebuilt {
            Ok(pipes) => {
                *set = PipeSet {
                    alt_setting: active,
                    pipes,
                };
                selected
            }
            Err(e) => {
                warn!(
                    "Interface {}: failed to rebuild pipes for alt setting {}: {}",
                    self.number, active, e
                );
                set.alt_setting = active;
                selected.and(Err(e))
            }
        };

        info!(
            "Interface {} now on alt setting {} with {} pipes",
            self.number,
            set.alt_setting,
            set.pipes.len()
        );
        result
    }

    /// Find the pipe for `address` and run `op` on it while the lock is held
    ///
    /// Returns `Err(input)` when no pipe of the current setting matches, handing
    /// the operation's input back untouched.
    pub fn do_pipe_operation<T, R, F>(
        &self,
        policy: LockPolicy,
        address: u8,
        input: T,
        op: F,
    ) -> Result<R, T>
    where
        F: FnOnce(&Pipe, T) -> R,
    {
        let guard = self.pipes.acquire(policy);
        Self::find_pipe_locked(&guard.pipes, address, input, op)
    }

    /// Lookup over a pipe slice the caller has already locked
    ///
    /// The caller must keep its guard alive for the duration of `op`.
    pub fn find_pipe_locked<T, R, F>(pipes: &[Pipe], address: u8, input: T, op: F) -> Result<R, T>
    where
        F: FnOnce(&Pipe, T) -> R,
    {
        match pipes.iter().find(|p| p.endpoint_address() == address) {
            Some(pipe) => Ok(op(pipe, input)),
            None => Err(input),
        }
    }

    /// Reset the interface as a whole
    pub fn reset(&self) -> Result<(), UsbError> {
        debug!("Resetting interface {}", self.number);
        self.device.reset_interface(self.number)
    }

    /// bInterfaceNumber
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Alternate setting the pipe set was last built for
    pub fn alt_setting(&self) -> u8 {
        self.pipes.read().alt_setting
    }

    /// Copy of the current endpoint metadata
    pub fn pipes_snapshot(&self) -> Vec<EndpointInfo> {
        self.snapshot().1
    }

    /// Alternate setting and endpoint metadata, read under one lock
    pub fn snapshot(&self) -> (u8, Vec<EndpointInfo>) {
        let set = self.pipes.read();
        (set.alt_setting, set.pipes.iter().map(|p| *p.info()).collect())
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (alt_setting, pipes) = self.snapshot();
        f.debug_struct("Interface")
            .field("number", &self.number)
            .field("alt_setting", &alt_setting)
            .field("pipes", &pipes)
            .finish()
    }
}

fn build_pipes(device: &Arc<dyn UsbBackend>, number: u8) -> Result<Vec<Pipe>, UsbError> {
    let count = device.endpoint_count(number)?;
    (0..count)
        .map(|index| Pipe::create(device.clone(), number, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockInterface};
    use common::test_utils::{bulk_in, bulk_out, interrupt_in};

    fn device() -> Arc<MockBackend> {
        Arc::new(MockBackend::new(vec![MockInterface::new(
            0,
            vec![
                vec![bulk_in(1, 512), bulk_out(2, 512)],
                vec![interrupt_in(3, 64, 1)],
                vec![],
            ],
        )]))
    }

    #[test]
    fn test_create_uses_current_alt_setting() {
        let device = device();
        device.force_alt_setting(0, 1);

        let iface = Interface::create(device, 0).unwrap();
        assert_eq!(iface.alt_setting(), 1);
        assert_eq!(iface.pipes_snapshot(), vec![interrupt_in(3, 64, 1)]);
    }

    #[test]
    fn test_create_unknown_interface_fails() {
        assert_eq!(Interface::create(device(), 4).unwrap_err(), UsbError::NotFound);
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let iface = Interface::create(device(), 0).unwrap();

        let hit = iface.do_pipe_operation(LockPolicy::Shared, 0x02, (), |pipe, ()| {
            pipe.max_packet_size()
        });
        assert_eq!(hit, Ok(512));

        let miss = iface.do_pipe_operation(LockPolicy::Shared, 0x83, 17u32, |_, _| ());
        assert_eq!(miss, Err(17));
    }

    #[test]
    fn test_exclusive_policy_lookup() {
        let iface = Interface::create(device(), 0).unwrap();
        let hit = iface.do_pipe_operation(LockPolicy::Exclusive, 0x81, (), |pipe, ()| {
            pipe.endpoint_address()
        });
        assert_eq!(hit, Ok(0x81));
    }

    #[test]
    fn test_find_pipe_locked_under_caller_guard() {
        let iface = Interface::create(device(), 0).unwrap();
        let guard = iface.pipes.acquire(LockPolicy::Shared);

        let found = Interface::find_pipe_locked(&guard.pipes, 0x81, (), |p, ()| p.interface());
        assert_eq!(found, Ok(0));
    }

    #[test]
    fn test_set_alt_setting_replaces_pipes() {
        let iface = Interface::create(device(), 0).unwrap();

        iface.set_alt_setting(1).unwrap();
        assert_eq!(iface.alt_setting(), 1);
        let old = iface.do_pipe_operation(LockPolicy::Shared, 0x81, (), |_, ()| ());
        assert!(old.is_err());
        let new = iface.do_pipe_operation(LockPolicy::Shared, 0x83, (), |_, ()| ());
        assert!(new.is_ok());

        iface.set_alt_setting(2).unwrap();
        assert!(iface.pipes_snapshot().is_empty());
    }

    #[test]
    fn test_rejected_switch_keeps_subsystem_state() {
        let iface = Interface::create(device(), 0).unwrap();

        assert_eq!(iface.set_alt_setting(9), Err(UsbError::InvalidParam));
        assert_eq!(iface.alt_setting(), 0);
        assert_eq!(iface.pipes_snapshot().len(), 2);
    }

    #[test]
    fn test_failed_rebuild_leaves_empty_set() {
        let device = device();
        let iface = Interface::create(device.clone(), 0).unwrap();

        device.set_endpoint_info_error(Some(UsbError::Io));
        assert_eq!(iface.set_alt_setting(1), Err(UsbError::Io));
        assert_eq!(iface.alt_setting(), 1);
        assert!(iface.pipes_snapshot().is_empty());

        let lookup = iface.do_pipe_operation(LockPolicy::Shared, 0x83, (), |_, ()| ());
        assert_eq!(lookup, Err(()));
    }

    #[test]
    fn test_rejected_switch_error_wins_over_rebuild_error() {
        let device = device();
        let iface = Interface::create(device.clone(), 0).unwrap();

        device.set_endpoint_info_error(Some(UsbError::Io));
        assert_eq!(iface.set_alt_setting(9), Err(UsbError::InvalidParam));
        assert_eq!(iface.alt_setting(), 0);
        assert!(iface.pipes_snapshot().is_empty());
    }

    #[test]
    fn test_reset_reaches_backend() {
        let device = device();
        let iface = Interface::create(device.clone(), 0).unwrap();
        iface.reset().unwrap();
        assert_eq!(device.interface_reset_count(0), 1);
    }
}
