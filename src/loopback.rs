/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! In-memory host stack
//!
//! `LoopbackHost` plays the part of the USB host stack and of a simple
//! USBTMC instrument behind it. It records every transfer and every released
//! resource, answers REQUEST_DEV_DEP_MSG_IN with queued replies and can be
//! told to fail any host operation. Useful to exercise sessions without
//! hardware.
//!
//! ```
//! use usbtmc_session::loopback::{LoopbackDevice, LoopbackHost};
//! use usbtmc_session::{Config, Connector};
//!
//! let host = LoopbackHost::new();
//! host.add_device(LoopbackDevice::new("HTG0001"));
//! host.queue_reply(b"ACME,4520,0,1.0\n");
//!
//! let connector = Connector::new(host.clone(), Config::default());
//! let mut session = connector.open_with_ecid(1).unwrap();
//! let idn = session.query_str("*IDN?", 256).unwrap();
//! assert_eq!(idn, "ACME,4520,0,1.0\n");
//! ```

use crate::config::{Sleeper, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID};
use crate::host::{
    ControlRequest, Direction, HostError, HostStack, PipeInfo, Service, TransferType, UsbDevice,
    UsbInterface,
};
use crate::usbtmc::{padded_len, HEADER_SIZE};
use std::cmp::min;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEV_DEP_MSG_OUT: u8 = 1;
const DEV_DEP_MSG_IN: u8 = 2;

/// Host operations that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    Enumerate,
    CreateDevice,
    OpenExclusive,
    SetConfiguration,
    Interface,
    OpenInterface,
    AlternateSetting,
    Pipes,
    PipeStatus,
    Read,
    Write,
    Control,
    Reset,
}

/// A resource given back to the host stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Released {
    /// enumerated but never turned into a device
    Service { serial: Option<String> },
    Interface { location: u32, index: u8 },
    Device { location: u32 },
}

/// One bulk transfer as seen by the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub direction: Direction,
    pub pipe: u8,
    pub data: Vec<u8>,
    pub timeout: Duration,
}

/// Description of a simulated device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopbackDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub location: u32,
    pub interfaces: u8,
    pub pipes: Vec<PipeInfo>,
    /// number of enumerations the device stays invisible for
    pub hidden_for: usize,
}

fn pipe(direction: Direction, number: u8, transfer_type: TransferType) -> PipeInfo {
    PipeInfo {
        direction,
        number,
        transfer_type,
        max_packet_size: 512,
        interval: 0,
    }
}

impl LoopbackDevice {
    pub fn new(serial: &str) -> Self {
        LoopbackDevice {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            serial: Some(serial.to_string()),
            location: 0x1410_0000,
            interfaces: 2,
            pipes: vec![
                pipe(Direction::In, 3, TransferType::Interrupt),
                pipe(Direction::Out, 2, TransferType::Bulk),
                pipe(Direction::In, 1, TransferType::Bulk),
            ],
            hidden_for: 0,
        }
    }

    pub fn without_serial(mut self) -> Self {
        self.serial = None;
        self
    }

    pub fn product(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    pub fn location(mut self, location: u32) -> Self {
        self.location = location;
        self
    }

    pub fn pipes(mut self, pipes: Vec<PipeInfo>) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn appears_after(mut self, enumerations: usize) -> Self {
        self.hidden_for = enumerations;
        self
    }
}

#[derive(Default)]
struct State {
    devices: Vec<LoopbackDevice>,
    enumerations: usize,
    /// (operation, error, fail only once)
    faults: Vec<(Fault, HostError, bool)>,
    released: Vec<Released>,
    transfers: Vec<Transfer>,
    controls: Vec<ControlRequest>,
    configurations: Vec<u8>,
    alt_settings: Vec<(u8, u8)>,
    resets: usize,
    /// DEV_DEP_MSG_OUT payload of the message being received
    incoming: Vec<u8>,
    messages: Vec<Vec<u8>>,
    /// bTag and size of the last REQUEST_DEV_DEP_MSG_IN
    pending_request: Option<(u8, usize)>,
    replies: VecDeque<Vec<u8>>,
    raw_responses: VecDeque<Vec<u8>>,
}

impl State {
    fn check(&mut self, fault: Fault) -> Result<(), HostError> {
        let pos = match self.faults.iter().position(|(f, _, _)| *f == fault) {
            Some(pos) => pos,
            None => return Ok(()),
        };

        let (_, error, once) = self.faults[pos].clone();
        if once {
            self.faults.remove(pos);
        }
        Err(error)
    }

    /// Interpret a bulk-OUT frame the way an instrument would
    fn accept(&mut self, frame: &[u8]) {
        if frame.len() < HEADER_SIZE {
            return;
        }

        let size = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;

        match frame[0] {
            DEV_DEP_MSG_OUT => {
                let end = min(HEADER_SIZE + size, frame.len());
                self.incoming.extend_from_slice(&frame[HEADER_SIZE..end]);
                if frame[8] & 0x01 != 0 {
                    let message = std::mem::take(&mut self.incoming);
                    self.messages.push(message);
                }
            }
            DEV_DEP_MSG_IN => self.pending_request = Some((frame[1], size)),
            _ => {}
        }
    }

    /// Next frame the instrument puts on the bulk-IN pipe
    fn respond(&mut self) -> Option<Vec<u8>> {
        if let Some(raw) = self.raw_responses.pop_front() {
            return Some(raw);
        }

        let (btag, size) = self.pending_request.take()?;
        let reply = self.replies.front_mut()?;

        let take = min(size, reply.len());
        let part: Vec<u8> = reply.drain(..take).collect();
        let end_of_message = reply.is_empty();
        if end_of_message {
            self.replies.pop_front();
        }

        let ts_bytes = (part.len() as u32).to_le_bytes();
        let mut frame = vec![
            DEV_DEP_MSG_IN,
            btag,
            !btag,
            0x00,
            ts_bytes[0],
            ts_bytes[1],
            ts_bytes[2],
            ts_bytes[3],
            u8::from(end_of_message),
            0x00,
            0x00,
            0x00,
        ];
        frame.extend_from_slice(&part);
        frame.resize(padded_len(frame.len()), 0);

        Some(frame)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloning gives another handle on the same simulated bus
#[derive(Clone, Default)]
pub struct LoopbackHost {
    state: Arc<Mutex<State>>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: LoopbackDevice) {
        lock(&self.state).devices.push(device);
    }

    /// Make `fault` fail with `error` until [`LoopbackHost::heal`]
    pub fn fail(&self, fault: Fault, error: HostError) {
        lock(&self.state).faults.push((fault, error, false));
    }

    /// Make the next `fault` operation fail with `error`
    pub fn fail_once(&self, fault: Fault, error: HostError) {
        lock(&self.state).faults.push((fault, error, true));
    }

    pub fn heal(&self, fault: Fault) {
        lock(&self.state).faults.retain(|(f, _, _)| *f != fault);
    }

    /// Queue a complete response message, handed out in pieces as the host
    /// requests them
    pub fn queue_reply(&self, payload: &[u8]) {
        lock(&self.state).replies.push_back(payload.to_vec());
    }

    /// Queue a bulk-IN frame delivered verbatim, ahead of any reply
    pub fn queue_raw_response(&self, frame: Vec<u8>) {
        lock(&self.state).raw_responses.push_back(frame);
    }

    pub fn enumerations(&self) -> usize {
        lock(&self.state).enumerations
    }

    pub fn released(&self) -> Vec<Released> {
        lock(&self.state).released.clone()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.state).transfers.clone()
    }

    /// Raw bulk-OUT frames, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .transfers
            .iter()
            .filter(|t| t.direction == Direction::Out)
            .map(|t| t.data.clone())
            .collect()
    }

    /// Complete DEV_DEP_MSG_OUT messages received by the instrument
    pub fn messages(&self) -> Vec<Vec<u8>> {
        lock(&self.state).messages.clone()
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        lock(&self.state).controls.clone()
    }

    pub fn configurations(&self) -> Vec<u8> {
        lock(&self.state).configurations.clone()
    }

    /// (interface, alternate setting) pairs that were selected
    pub fn alt_settings(&self) -> Vec<(u8, u8)> {
        lock(&self.state).alt_settings.clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }
}

impl HostStack for LoopbackHost {
    type Service = LoopbackService;
    type Device = LoopbackHandle;
    type Interface = LoopbackInterface;

    fn matching_services(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<LoopbackService>, HostError> {
        let mut state = lock(&self.state);
        state.enumerations += 1;
        state.check(Fault::Enumerate)?;

        let mut services = Vec::new();
        for device in state.devices.iter_mut() {
            if device.hidden_for > 0 {
                device.hidden_for -= 1;
                continue;
            }

            if device.vendor_id == vendor_id && device.product_id == product_id {
                services.push(LoopbackService {
                    state: Arc::clone(&self.state),
                    device: device.clone(),
                    consumed: false,
                });
            }
        }

        Ok(services)
    }
}

pub struct LoopbackService {
    state: Arc<Mutex<State>>,
    device: LoopbackDevice,
    consumed: bool,
}

impl Service for LoopbackService {
    type Device = LoopbackHandle;

    fn serial_number(&self) -> Option<String> {
        self.device.serial.clone()
    }

    fn create_device(mut self) -> Result<LoopbackHandle, HostError> {
        let checked = lock(&self.state).check(Fault::CreateDevice);
        checked?;

        self.consumed = true;
        Ok(LoopbackHandle {
            state: Arc::clone(&self.state),
            device: self.device.clone(),
            opened: false,
        })
    }
}

impl Drop for LoopbackService {
    fn drop(&mut self) {
        if !self.consumed {
            let serial = self.device.serial.clone();
            lock(&self.state).released.push(Released::Service { serial });
        }
    }
}

/// Device resource of the loopback host
pub struct LoopbackHandle {
    state: Arc<Mutex<State>>,
    device: LoopbackDevice,
    opened: bool,
}

impl LoopbackHandle {
    pub fn is_opened(&self) -> bool {
        self.opened
    }
}

impl UsbDevice for LoopbackHandle {
    type Interface = LoopbackInterface;

    fn product_id(&self) -> u16 {
        self.device.product_id
    }

    fn location_id(&self) -> u32 {
        self.device.location
    }

    fn open_exclusive(&mut self) -> Result<(), HostError> {
        lock(&self.state).check(Fault::OpenExclusive)?;
        self.opened = true;
        Ok(())
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), HostError> {
        let mut state = lock(&self.state);
        state.check(Fault::SetConfiguration)?;
        state.configurations.push(configuration);
        Ok(())
    }

    fn interface(&mut self, index: u8) -> Result<LoopbackInterface, HostError> {
        lock(&self.state).check(Fault::Interface)?;

        if index >= self.device.interfaces {
            return Err(HostError::Other(format!("no interface {}", index)));
        }

        Ok(LoopbackInterface {
            state: Arc::clone(&self.state),
            location: self.device.location,
            index,
            pipes: self.device.pipes.clone(),
            opened: false,
        })
    }

    fn control_transfer(
        &mut self,
        request: &ControlRequest,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, HostError> {
        let mut state = lock(&self.state);
        state.check(Fault::Control)?;
        state.controls.push(*request);

        if request.is_in() {
            for b in data.iter_mut() {
                *b = 0;
            }
        }

        Ok(data.len())
    }

    fn reset(&mut self) -> Result<(), HostError> {
        let mut state = lock(&self.state);
        state.check(Fault::Reset)?;
        state.resets += 1;
        Ok(())
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        let location = self.device.location;
        lock(&self.state).released.push(Released::Device { location });
    }
}

/// Interface resource of the loopback host
pub struct LoopbackInterface {
    state: Arc<Mutex<State>>,
    location: u32,
    index: u8,
    pipes: Vec<PipeInfo>,
    opened: bool,
}

impl LoopbackInterface {
    fn check_pipe(&self, pipe: u8) -> Result<(), HostError> {
        if pipe == 0 || usize::from(pipe) > self.pipes.len() {
            return Err(HostError::Other(format!("no pipe {}", pipe)));
        }
        Ok(())
    }
}

impl UsbInterface for LoopbackInterface {
    fn open(&mut self) -> Result<(), HostError> {
        lock(&self.state).check(Fault::OpenInterface)?;
        self.opened = true;
        Ok(())
    }

    fn set_alternate_setting(&mut self, alt_setting: u8) -> Result<(), HostError> {
        let mut state = lock(&self.state);
        state.check(Fault::AlternateSetting)?;
        state.alt_settings.push((self.index, alt_setting));
        Ok(())
    }

    fn pipes(&self) -> Result<Vec<PipeInfo>, HostError> {
        lock(&self.state).check(Fault::Pipes)?;
        Ok(self.pipes.clone())
    }

    fn pipe_status(&self, pipe: u8) -> Result<(), HostError> {
        if !self.opened {
            return Err(HostError::NotOpen);
        }
        lock(&self.state).check(Fault::PipeStatus)?;
        self.check_pipe(pipe)
    }

    fn read_pipe(
        &mut self,
        pipe: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        self.check_pipe(pipe)?;

        let mut state = lock(&self.state);
        state.check(Fault::Read)?;

        let response = state.respond().ok_or(HostError::Timeout)?;
        let n = min(response.len(), data.len());
        data[..n].copy_from_slice(&response[..n]);

        state.transfers.push(Transfer {
            direction: Direction::In,
            pipe,
            data: response[..n].to_vec(),
            timeout,
        });

        Ok(n)
    }

    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> Result<usize, HostError> {
        self.check_pipe(pipe)?;

        let mut state = lock(&self.state);
        state.transfers.push(Transfer {
            direction: Direction::Out,
            pipe,
            data: data.to_vec(),
            timeout,
        });
        state.check(Fault::Write)?;
        state.accept(data);

        Ok(data.len())
    }
}

impl Drop for LoopbackInterface {
    fn drop(&mut self) {
        let released = Released::Interface {
            location: self.location,
            index: self.index,
        };
        lock(&self.state).released.push(released);
    }
}

/// Sleeper that only remembers what it was asked to wait for
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}
