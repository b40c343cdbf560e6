/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Raw control and bulk transfers on an open session

use crate::error::{Error, Result};
use crate::host::{
    ControlRequest, Direction, HostError, HostStack, PipeInfo, TransferType, UsbDevice,
    UsbInterface,
};
use crate::session::Session;
use std::convert::TryFrom;
use std::time::Duration;
use tracing::{debug, warn};

/// 1-based reference of the first bulk pipe flowing in the direction of
/// `endpoint`. Only the direction bit of the address is considered.
pub fn resolve_pipe(pipes: &[PipeInfo], endpoint: u8) -> Option<u8> {
    let direction = Direction::of_endpoint(endpoint);

    pipes
        .iter()
        .position(|p| p.transfer_type == TransferType::Bulk && p.direction == direction)
        .and_then(|i| u8::try_from(i + 1).ok())
}

fn map_transfer_error(e: &HostError) -> Error {
    match e {
        HostError::Timeout | HostError::TransactionTimeout => Error::Timeout,
        HostError::NotResponding | HostError::NoDevice => Error::NoDevice,
        _ => Error::UnknownError,
    }
}

fn map_pipe_status(e: &HostError) -> Error {
    match e {
        HostError::NoDevice => Error::NoDevice,
        HostError::NotOpen => Error::UnableToConnect,
        _ => Error::UsbStatus,
    }
}

impl<H: HostStack> Session<H> {
    /// Issue a control transfer whose data stage is `data`. Returns the
    /// number of bytes actually transferred.
    pub fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let length = u16::try_from(data.len()).map_err(|_| Error::InvalidInput)?;
        let open = self.open_mut()?;

        let request = ControlRequest {
            request_type,
            request,
            value,
            index,
            length,
        };

        open.device
            .control_transfer(&request, data, timeout)
            .map_err(|e| {
                warn!("control transfer {:02x?} failed: {}", request.setup_packet(), e);
                map_transfer_error(&e)
            })
    }

    /// Bulk transfer on the claimed interface. The direction of `endpoint`
    /// decides whether `data` is read into or written from.
    pub fn bulk_transfer(&mut self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let debug = self.config.debug;
        let open = self.open_mut()?;
        let interface = open.interface.as_mut().ok_or(Error::UsbInterface)?;

        let pipes = interface.pipes().map_err(|_| Error::UsbInterface)?;
        let pipe = resolve_pipe(&pipes, endpoint).ok_or(Error::UsbInterface)?;

        interface.pipe_status(pipe).map_err(|e| map_pipe_status(&e))?;

        let result = match Direction::of_endpoint(endpoint) {
            Direction::In => interface.read_pipe(pipe, data, timeout),
            Direction::Out => interface.write_pipe(pipe, data, timeout),
        };

        match result {
            Ok(n) => {
                if debug {
                    debug!("bulk transfer on {:#04x} (pipe {}): {} bytes", endpoint, pipe, n);
                }
                Ok(n)
            }
            Err(e) => {
                warn!("bulk transfer on {:#04x} failed: {}", endpoint, e);
                Err(Error::Pipe)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe(direction: Direction, number: u8, transfer_type: TransferType) -> PipeInfo {
        PipeInfo {
            direction,
            number,
            transfer_type,
            max_packet_size: 512,
            interval: 0,
        }
    }

    #[test]
    fn resolves_first_bulk_pipe_per_direction() {
        let pipes = [
            pipe(Direction::In, 3, TransferType::Interrupt),
            pipe(Direction::Out, 2, TransferType::Bulk),
            pipe(Direction::In, 1, TransferType::Bulk),
            pipe(Direction::In, 5, TransferType::Bulk),
        ];

        assert_eq!(resolve_pipe(&pipes, 0x81), Some(3));
        assert_eq!(resolve_pipe(&pipes, 0x04), Some(2));
        // endpoint number does not matter, only the direction
        assert_eq!(resolve_pipe(&pipes, 0x85), Some(3));
    }

    #[test]
    fn no_matching_pipe() {
        let pipes = [pipe(Direction::In, 3, TransferType::Interrupt)];
        assert_eq!(resolve_pipe(&pipes, 0x81), None);
        assert_eq!(resolve_pipe(&[], 0x04), None);
    }

    #[test]
    fn host_errors_map_to_library_errors() {
        assert_eq!(map_transfer_error(&HostError::Timeout), Error::Timeout);
        assert_eq!(map_transfer_error(&HostError::TransactionTimeout), Error::Timeout);
        assert_eq!(map_transfer_error(&HostError::NotResponding), Error::NoDevice);
        assert_eq!(map_transfer_error(&HostError::NoDevice), Error::NoDevice);
        assert_eq!(map_transfer_error(&HostError::Busy), Error::UnknownError);

        assert_eq!(map_pipe_status(&HostError::NotOpen), Error::UnableToConnect);
        assert_eq!(map_pipe_status(&HostError::NoDevice), Error::NoDevice);
        assert_eq!(map_pipe_status(&HostError::Busy), Error::UsbStatus);
    }
}
