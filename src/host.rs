/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Capabilities consumed from the USB host stack
//!
//! Sessions never talk to a USB library directly, they go through these
//! traits. Resources handed out by a host stack are released when they are
//! dropped, so whoever owns a value is the one that releases it.

use std::time::Duration;
use thiserror::Error;

/// Direction bit of an endpoint address
pub const ENDPOINT_DIRECTION_MASK: u8 = 0x80;

/// Result codes reported by the host stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("transfer timed out")]
    Timeout,
    #[error("transaction timed out")]
    TransactionTimeout,
    #[error("device not responding")]
    NotResponding,
    #[error("no such device")]
    NoDevice,
    #[error("resource not open")]
    NotOpen,
    #[error("resource busy")]
    Busy,
    #[error("{0}")]
    Other(String),
}

impl From<rusb::Error> for HostError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => HostError::Timeout,
            rusb::Error::NoDevice => HostError::NoDevice,
            rusb::Error::Busy => HostError::Busy,
            other => HostError::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn of_endpoint(address: u8) -> Direction {
        if address & ENDPOINT_DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl From<rusb::TransferType> for TransferType {
    fn from(t: rusb::TransferType) -> Self {
        match t {
            rusb::TransferType::Control => TransferType::Control,
            rusb::TransferType::Isochronous => TransferType::Isochronous,
            rusb::TransferType::Bulk => TransferType::Bulk,
            rusb::TransferType::Interrupt => TransferType::Interrupt,
        }
    }
}

/// Properties of one pipe of a claimed interface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeInfo {
    pub direction: Direction,
    /// endpoint number, without the direction bit
    pub number: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl PipeInfo {
    /// Full endpoint address including the direction bit
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | ENDPOINT_DIRECTION_MASK,
            Direction::Out => self.number & !ENDPOINT_DIRECTION_MASK,
        }
    }
}

/// Setup stage of a control transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    /// Returns true when the data stage flows from device to host
    pub fn is_in(&self) -> bool {
        Direction::of_endpoint(self.request_type) == Direction::In
    }

    /// The 8 byte setup packet as it goes on the wire. Multi-byte fields are
    /// little-endian whatever the host byte order.
    pub fn setup_packet(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();

        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Entry point of a host stack: finds device services
pub trait HostStack {
    type Service: Service<Device = Self::Device>;
    type Device: UsbDevice<Interface = Self::Interface>;
    type Interface: UsbInterface;

    /// All services matching the vendor and product id, in enumeration order
    fn matching_services(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<Self::Service>, HostError>;
}

/// A device known to the host stack but not yet opened.
///
/// Dropping a service releases it.
pub trait Service {
    type Device;

    /// Serial number string cached at enumeration time, no device I/O
    fn serial_number(&self) -> Option<String>;

    /// Create the device level resource, consuming the service
    fn create_device(self) -> Result<Self::Device, HostError>;
}

/// Device level resource. Dropping it closes the device.
pub trait UsbDevice {
    type Interface;

    fn product_id(&self) -> u16;

    fn location_id(&self) -> u32;

    /// Open the device, seizing it from other claimants
    fn open_exclusive(&mut self) -> Result<(), HostError>;

    fn set_configuration(&mut self, configuration: u8) -> Result<(), HostError>;

    /// Look up the interface at `index` of the active configuration. The
    /// returned resource still has to be opened.
    fn interface(&mut self, index: u8) -> Result<Self::Interface, HostError>;

    fn control_transfer(
        &mut self,
        request: &ControlRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError>;

    fn reset(&mut self) -> Result<(), HostError>;
}

/// Interface level resource. Dropping it closes the interface.
///
/// Pipes are referenced by their 1-based position in [`UsbInterface::pipes`].
pub trait UsbInterface {
    fn open(&mut self) -> Result<(), HostError>;

    fn set_alternate_setting(&mut self, alt_setting: u8) -> Result<(), HostError>;

    /// Pipe descriptors of the active alternate setting, in ascending order
    fn pipes(&self) -> Result<Vec<PipeInfo>, HostError>;

    fn pipe_status(&self, pipe: u8) -> Result<(), HostError>;

    fn read_pipe(&mut self, pipe: u8, data: &mut [u8], timeout: Duration)
        -> Result<usize, HostError>;

    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> Result<usize, HostError>;
}
