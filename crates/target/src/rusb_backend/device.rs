//! Opened libusb device
//!
//! Opens a device, detaches kernel drivers, claims every interface of the
//! active configuration and caches the configuration's endpoint layout.

use super::transfers::map_rusb_error;
use protocol::{EndpointInfo, EndpointType, SetupPacket, UsbError};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Endpoints of every alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    /// Indexed by bAlternateSetting
    pub alt_settings: Vec<Vec<EndpointInfo>>,
}

impl InterfaceLayout {
    pub fn endpoints(&self, alt_setting: u8) -> Result<&[EndpointInfo], UsbError> {
        self.alt_settings
            .get(alt_setting as usize)
            .map(Vec::as_slice)
            .ok_or(UsbError::NotFound)
    }
}

/// Alternate setting each claimed interface was last switched to
///
/// Only a successful switch changes an entry. libusb restores the previous
/// settings itself when the device is reset, so a reset leaves this alone.
#[derive(Debug)]
pub struct AltSettingTracker {
    current: Mutex<HashMap<u8, u8>>,
}

impl AltSettingTracker {
    /// Every interface starts on setting 0
    pub fn new(interfaces: impl IntoIterator<Item = u8>) -> Self {
        let current = interfaces.into_iter().map(|number| (number, 0)).collect();
        Self {
            current: Mutex::new(current),
        }
    }

    pub fn get(&self, interface: u8) -> u8 {
        self.lock().get(&interface).copied().unwrap_or(0)
    }

    pub fn record(&self, interface: u8, alt_setting: u8) {
        self.lock().insert(interface, alt_setting);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u8, u8>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Device handle plus the cached layout of its active configuration
pub struct UsbDevice {
    /// Transfers take this shared; reconfiguration (alt setting, halt
    /// clearing, reset) takes it exclusive since rusb needs `&mut`
    handle: RwLock<DeviceHandle<Context>>,
    descriptor: Vec<u8>,
    layout: Vec<InterfaceLayout>,
    current: AltSettingTracker,
    claimed: Vec<u8>,
}

impl UsbDevice {
    /// Open the first device matching `vendor_id:product_id`
    pub fn open_by_id(
        context: &Context,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Self, UsbError> {
        let devices = context.devices().map_err(map_rusb_error)?;

        let device = devices
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                warn!("No device {:04x}:{:04x} present", vendor_id, product_id);
                UsbError::NotFound
            })?;

        Self::open(device)
    }

    /// Open `device` and claim all interfaces of its active configuration
    pub fn open(device: Device<Context>) -> Result<Self, UsbError> {
        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        debug!(
            "Opened device at bus {} address {}",
            device.bus_number(),
            device.address()
        );

        let config = device.active_config_descriptor().map_err(|e| {
            warn!("Failed to get active config descriptor: {}", e);
            map_rusb_error(e)
        })?;

        let mut layout = Vec::new();
        let mut claimed = Vec::new();

        for interface in config.interfaces() {
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        number, e
                    );
                }
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("Failed to claim interface {}: {}", number, e);
                release_all(&mut handle, &claimed);
                return Err(map_rusb_error(e));
            }
            claimed.push(number);

            let mut alt_settings: Vec<Vec<EndpointInfo>> = Vec::new();
            for setting in interface.descriptors() {
                let index = setting.setting_number() as usize;
                if alt_settings.len() <= index {
                    alt_settings.resize(index + 1, Vec::new());
                }
                alt_settings[index] = setting
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        transfer_type: map_transfer_type(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                    })
                    .collect();
            }

            debug!(
                "Claimed interface {} with {} alternate settings",
                number,
                alt_settings.len()
            );
            layout.push(InterfaceLayout {
                number,
                alt_settings,
            });
        }

        let descriptor = read_device_descriptor(&handle)?;
        let current = AltSettingTracker::new(layout.iter().map(|iface| iface.number));

        info!("Device opened with {} interfaces claimed", claimed.len());

        Ok(Self {
            handle: RwLock::new(handle),
            descriptor,
            layout,
            current,
            claimed,
        })
    }

    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    pub fn layout(&self) -> &[InterfaceLayout] {
        &self.layout
    }

    pub fn interface(&self, number: u8) -> Result<&InterfaceLayout, UsbError> {
        self.layout
            .iter()
            .find(|iface| iface.number == number)
            .ok_or(UsbError::NotFound)
    }

    pub fn current_alt_setting(&self, number: u8) -> Result<u8, UsbError> {
        self.interface(number)?;
        Ok(self.current.get(number))
    }

    /// Endpoints of `number`'s current alternate setting
    pub fn current_endpoints(&self, number: u8) -> Result<&[EndpointInfo], UsbError> {
        let alt = self.current_alt_setting(number)?;
        self.interface(number)?.endpoints(alt)
    }

    pub fn set_alt_setting(&self, number: u8, alt_setting: u8) -> Result<(), UsbError> {
        let iface = self.interface(number)?;
        if iface.endpoints(alt_setting).is_err() {
            return Err(UsbError::InvalidParam);
        }

        self.handle_mut()
            .set_alternate_setting(number, alt_setting)
            .map_err(map_rusb_error)?;
        self.current.record(number, alt_setting);

        debug!("Interface {} switched to alt setting {}", number, alt_setting);
        Ok(())
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        self.handle_mut().clear_halt(endpoint).map_err(map_rusb_error)
    }

    /// Reset the device; libusb re-selects the configuration and the
    /// alternate settings that were active before
    pub fn reset(&self) -> Result<(), UsbError> {
        self.handle_mut().reset().map_err(map_rusb_error)
    }

    pub fn handle(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_mut(&self) -> RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        let handle = self.handle.get_mut().unwrap_or_else(PoisonError::into_inner);
        release_all(handle, &self.claimed);
        debug!("Closed device");
    }
}

/// Release claimed interfaces and hand them back to the kernel
fn release_all(handle: &mut DeviceHandle<Context>, claimed: &[u8]) {
    for &interface in claimed {
        if let Err(e) = handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if let Err(e) = handle.attach_kernel_driver(interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        }
    }
}

fn read_device_descriptor(handle: &DeviceHandle<Context>) -> Result<Vec<u8>, UsbError> {
    let setup = SetupPacket::get_device_descriptor();
    let mut buffer = vec![0u8; setup.length as usize];

    let len = handle
        .read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            Duration::from_secs(1),
        )
        .map_err(map_rusb_error)?;

    buffer.truncate(len);
    Ok(buffer)
}

pub(crate) fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointType {
    match transfer_type {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}
