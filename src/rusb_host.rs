/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Host stack backed by libusb through rusb

use crate::host::{
    ControlRequest, Direction, HostError, HostStack, PipeInfo, Service, UsbDevice, UsbInterface,
};
use rusb::{Device, DeviceDescriptor, DeviceHandle, GlobalContext, UsbContext};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// The device handle is shared between the device and its interfaces, the
/// interfaces are claimed on it.
type SharedHandle<C> = Arc<Mutex<DeviceHandle<C>>>;

fn lock<C: UsbContext>(handle: &SharedHandle<C>) -> Result<MutexGuard<'_, DeviceHandle<C>>, HostError> {
    handle
        .lock()
        .map_err(|_| HostError::Other("device handle lock poisoned".to_string()))
}

pub struct RusbHost<C: UsbContext = GlobalContext> {
    context: C,
}

impl RusbHost<GlobalContext> {
    pub fn new() -> Self {
        RusbHost {
            context: GlobalContext::default(),
        }
    }
}

impl Default for RusbHost<GlobalContext> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: UsbContext> RusbHost<C> {
    pub fn with_context(context: C) -> Self {
        RusbHost { context }
    }
}

impl<C: UsbContext> HostStack for RusbHost<C> {
    type Service = RusbService<C>;
    type Device = RusbDevice<C>;
    type Interface = RusbInterface<C>;

    fn matching_services(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<RusbService<C>>, HostError> {
        let devices = self.context.devices()?;
        let mut services = Vec::new();

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    trace!("skipping device without descriptor: {}", e);
                    continue;
                }
            };

            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }

            // libusb keeps no string cache, so read it once here
            let serial = read_serial(&device, &descriptor);
            services.push(RusbService {
                device,
                descriptor,
                serial,
            });
        }

        Ok(services)
    }
}

/// libusb reports NOT_FOUND when the device re-enumerated during the reset
fn reset_error(e: rusb::Error) -> HostError {
    match e {
        rusb::Error::NotFound => HostError::NotResponding,
        other => other.into(),
    }
}

fn read_serial<C: UsbContext>(device: &Device<C>, descriptor: &DeviceDescriptor) -> Option<String> {
    let handle = match device.open() {
        Ok(h) => h,
        Err(e) => {
            trace!("cannot open device to read serial number: {}", e);
            return None;
        }
    };

    handle.read_serial_number_string_ascii(descriptor).ok()
}

/// Enumerated device together with its cached serial number
pub struct RusbService<C: UsbContext> {
    device: Device<C>,
    descriptor: DeviceDescriptor,
    serial: Option<String>,
}

impl<C: UsbContext> Service for RusbService<C> {
    type Device = RusbDevice<C>;

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    fn create_device(self) -> Result<RusbDevice<C>, HostError> {
        Ok(RusbDevice {
            device: self.device,
            descriptor: self.descriptor,
            handle: None,
        })
    }
}

pub struct RusbDevice<C: UsbContext> {
    device: Device<C>,
    descriptor: DeviceDescriptor,
    handle: Option<SharedHandle<C>>,
}

impl<C: UsbContext> RusbDevice<C> {
    fn handle(&self) -> Result<&SharedHandle<C>, HostError> {
        self.handle.as_ref().ok_or(HostError::NotOpen)
    }
}

impl<C: UsbContext> UsbDevice for RusbDevice<C> {
    type Interface = RusbInterface<C>;

    fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Bus number in the top byte followed by one nibble per hub port
    fn location_id(&self) -> u32 {
        let mut location = u32::from(self.device.bus_number()) << 24;

        if let Ok(ports) = self.device.port_numbers() {
            for (depth, port) in ports.iter().take(6).enumerate() {
                location |= u32::from(port & 0x0f) << (20 - 4 * depth);
            }
        }

        location
    }

    fn open_exclusive(&mut self) -> Result<(), HostError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open()?;
        self.handle = Some(Arc::new(Mutex::new(handle)));
        Ok(())
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), HostError> {
        let handle = lock(self.handle()?)?;

        // setting the active configuration again resets the device state
        if handle.active_configuration() != Ok(configuration) {
            handle.set_active_configuration(configuration)?;
            debug!("set configuration to {}", configuration);
        }

        Ok(())
    }

    fn interface(&mut self, index: u8) -> Result<RusbInterface<C>, HostError> {
        let handle = Arc::clone(self.handle()?);
        let config = self.device.active_config_descriptor()?;

        let iface = config
            .interfaces()
            .find(|iface| iface.number() == index)
            .ok_or_else(|| HostError::Other(format!("no interface {}", index)))?;

        let alt_settings = iface
            .descriptors()
            .map(|desc| {
                let pipes = desc
                    .endpoint_descriptors()
                    .map(|ep| PipeInfo {
                        direction: match ep.direction() {
                            rusb::Direction::In => Direction::In,
                            rusb::Direction::Out => Direction::Out,
                        },
                        number: ep.number(),
                        transfer_type: ep.transfer_type().into(),
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                    })
                    .collect();
                (desc.setting_number(), pipes)
            })
            .collect();

        Ok(RusbInterface {
            handle,
            number: index,
            alt_settings,
            alt_setting: 0,
            claimed: false,
            has_kernel_driver: false,
        })
    }

    fn control_transfer(
        &mut self,
        request: &ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        let handle = lock(self.handle()?)?;

        let transferred = if request.is_in() {
            handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            )?
        } else {
            handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            )?
        };

        Ok(transferred)
    }

    fn reset(&mut self) -> Result<(), HostError> {
        let handle = lock(self.handle()?)?;
        handle.reset().map_err(reset_error)
    }
}

pub struct RusbInterface<C: UsbContext> {
    handle: SharedHandle<C>,
    number: u8,
    /// pipes of every alternate setting, keyed by setting number
    alt_settings: Vec<(u8, Vec<PipeInfo>)>,
    alt_setting: u8,
    claimed: bool,
    // for linux kernel
    has_kernel_driver: bool,
}

impl<C: UsbContext> RusbInterface<C> {
    fn endpoint(&self, pipe: u8) -> Result<u8, HostError> {
        let pipes = self.pipes()?;

        pipe.checked_sub(1)
            .and_then(|i| pipes.get(usize::from(i)))
            .map(PipeInfo::address)
            .ok_or_else(|| HostError::Other(format!("no pipe {}", pipe)))
    }
}

impl<C: UsbContext> UsbInterface for RusbInterface<C> {
    fn open(&mut self) -> Result<(), HostError> {
        if self.claimed {
            return Ok(());
        }

        let handle = lock(&self.handle)?;

        // detach kernel driver if necessary
        if let Ok(true) = handle.kernel_driver_active(self.number) {
            handle.detach_kernel_driver(self.number)?;
            self.has_kernel_driver = true;
        }

        handle.claim_interface(self.number)?;
        self.claimed = true;
        Ok(())
    }

    fn set_alternate_setting(&mut self, alt_setting: u8) -> Result<(), HostError> {
        let handle = lock(&self.handle)?;
        handle.set_alternate_setting(self.number, alt_setting)?;
        self.alt_setting = alt_setting;
        Ok(())
    }

    fn pipes(&self) -> Result<Vec<PipeInfo>, HostError> {
        self.alt_settings
            .iter()
            .find(|(setting, _)| *setting == self.alt_setting)
            .map(|(_, pipes)| pipes.clone())
            .ok_or_else(|| HostError::Other(format!("no alternate setting {}", self.alt_setting)))
    }

    fn pipe_status(&self, pipe: u8) -> Result<(), HostError> {
        if !self.claimed {
            return Err(HostError::NotOpen);
        }

        self.endpoint(pipe).map(|_| ())
    }

    fn read_pipe(
        &mut self,
        pipe: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        let endpoint = self.endpoint(pipe)?;
        let handle = lock(&self.handle)?;
        Ok(handle.read_bulk(endpoint, data, timeout)?)
    }

    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> Result<usize, HostError> {
        let endpoint = self.endpoint(pipe)?;
        let handle = lock(&self.handle)?;
        Ok(handle.write_bulk(endpoint, data, timeout)?)
    }
}

impl<C: UsbContext> Drop for RusbInterface<C> {
    fn drop(&mut self) {
        if !self.claimed {
            return;
        }

        if let Ok(handle) = self.handle.lock() {
            if let Err(e) = handle.release_interface(self.number) {
                debug!("failed to release interface {}: {}", self.number, e);
            }

            if self.has_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(self.number) {
                    debug!("failed to attach kernel driver: {}", e);
                }
            }
        }
    }
}
