/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Session lifecycle: open, configure, reset, reconnect and close

use crate::config::{Config, RetryPolicy, Sleeper, ThreadSleeper};
use crate::error::{Error, Result};
use crate::event::{Event, EventCallback, EventRegistry, EventType};
use crate::host::{HostError, HostStack, Service, UsbDevice, UsbInterface};
use crate::matcher;
use crate::usbtmc::UsbtmcState;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Identifies a session for the lifetime of the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> SessionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

/// Resources held while open. Fields drop in declaration order, so the
/// interface is released before the device.
pub(crate) struct OpenDevice<H: HostStack> {
    pub(crate) interface: Option<H::Interface>,
    pub(crate) device: H::Device,
}

pub(crate) enum Link<H: HostStack> {
    Closed,
    Open(OpenDevice<H>),
}

/// Exclusive connection to one device.
///
/// Dropping an open session closes it.
pub struct Session<H: HostStack> {
    id: SessionId,
    pub(crate) config: Config,
    ecid: u64,
    mode: u16,
    usb_config: u8,
    usb_interface: u8,
    usb_alt_interface: u8,
    pub(crate) link: Link<H>,
    events: EventRegistry,
    pub(crate) tmc: UsbtmcState,
}

impl<H: HostStack> Session<H> {
    /// Open the device behind `service`: exclusive open, configuration,
    /// interface. Anything acquired is released again on failure.
    pub(crate) fn open_service(service: H::Service, ecid: u64, config: Config) -> Result<Self> {
        let serial = service.serial_number();

        let mut device = service.create_device().map_err(|e| {
            warn!("failed to create device: {}", e);
            Error::UnknownError
        })?;

        let mode = device.product_id();
        if config.debug {
            debug!(
                serial = serial.as_deref().unwrap_or(""),
                "opening device {:04x}:{:04x} @ {:#010x}",
                config.vendor_id,
                mode,
                device.location_id()
            );
        }

        if let Err(e) = device.open_exclusive() {
            warn!("failed to open device: {}", e);
            return Err(Error::UnableToConnect);
        }

        let configuration = config.configuration;
        let interface = config.interface;
        let alt_interface = config.alt_interface;

        let mut session = Session {
            id: SessionId::next(),
            config,
            ecid,
            mode,
            usb_config: 0,
            usb_interface: 0,
            usb_alt_interface: 0,
            link: Link::Open(OpenDevice {
                interface: None,
                device,
            }),
            events: EventRegistry::new(),
            tmc: UsbtmcState::default(),
        };

        session.set_configuration(configuration)?;
        session.set_interface(interface, alt_interface)?;

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.link {
            Link::Closed => SessionState::Closed,
            Link::Open(_) => SessionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// ECID the session was opened with, 0 for "first device found"
    pub fn ecid(&self) -> u64 {
        self.ecid
    }

    /// Product id of the opened device
    pub fn mode(&self) -> u16 {
        self.mode
    }

    pub fn configuration(&self) -> u8 {
        self.usb_config
    }

    pub fn interface(&self) -> u8 {
        self.usb_interface
    }

    pub fn alt_interface(&self) -> u8 {
        self.usb_alt_interface
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match self.link {
            Link::Open(_) => Ok(()),
            Link::Closed => Err(Error::NoDevice),
        }
    }

    pub(crate) fn open_mut(&mut self) -> Result<&mut OpenDevice<H>> {
        match &mut self.link {
            Link::Open(open) => Ok(open),
            Link::Closed => Err(Error::NoDevice),
        }
    }

    pub fn set_configuration(&mut self, configuration: u8) -> Result<()> {
        let debug = self.config.debug;
        let open = self.open_mut()?;

        if debug {
            debug!("setting to configuration {}", configuration);
        }

        if let Err(e) = open.device.set_configuration(configuration) {
            warn!("error setting configuration: {}", e);
            return Err(Error::UsbConfiguration);
        }

        self.usb_config = configuration;
        Ok(())
    }

    /// Release the current interface, if any, then claim `interface`.
    /// The alternate setting is only applied to interface 1.
    pub fn set_interface(&mut self, interface: u8, alt_interface: u8) -> Result<()> {
        let debug = self.config.debug;
        let open = self.open_mut()?;

        if debug {
            debug!("setting to interface {}:{}", interface, alt_interface);
        }

        drop(open.interface.take());

        let mut claimed = open.device.interface(interface).map_err(|e| {
            warn!("failed to find requested interface {}: {}", interface, e);
            Error::UsbInterface
        })?;

        claimed.open().map_err(|e| {
            warn!("error opening interface: {}", e);
            Error::UsbInterface
        })?;

        if interface == 1 {
            claimed.set_alternate_setting(alt_interface).map_err(|e| {
                warn!("error setting alternate interface: {}", e);
                Error::UsbInterface
            })?;
        }

        open.interface = Some(claimed);
        self.usb_interface = interface;
        self.usb_alt_interface = alt_interface;
        Ok(())
    }

    /// Reset the device. The device not answering is expected while it
    /// resets and is not an error.
    pub fn reset(&mut self) -> Result<()> {
        let open = self.open_mut()?;

        match open.device.reset() {
            Ok(()) | Err(HostError::NotResponding) => Ok(()),
            Err(e) => {
                warn!("error sending device reset: {}", e);
                Err(Error::UnknownError)
            }
        }
    }

    /// Notify the disconnected callback, then release interface and device.
    /// Does nothing on a closed session.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        let id = self.id;
        self.notify(Event::new(EventType::Disconnected, id));

        if let Link::Open(open) = std::mem::replace(&mut self.link, Link::Closed) {
            let OpenDevice { interface, device } = open;
            drop(interface);
            drop(device);
        }

        if self.config.debug {
            debug!("closed session {}", id);
        }
    }

    /// Install `callback` for `event_type`, returning the one it replaces
    pub fn event_subscribe<F>(&mut self, event_type: EventType, callback: F) -> Option<EventCallback>
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.events.subscribe(event_type, Box::new(callback))
    }

    pub fn event_unsubscribe(&mut self, event_type: EventType) -> Option<EventCallback> {
        self.events.unsubscribe(event_type)
    }

    pub(crate) fn install_callback(&mut self, event_type: EventType, callback: EventCallback) {
        self.events.subscribe(event_type, callback);
    }

    pub(crate) fn notify(&mut self, event: Event<'_>) {
        self.events.fire(&event);
    }
}

impl<H: HostStack> Drop for Session<H> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<H: HostStack> fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("ecid", &self.ecid)
            .field("mode", &self.mode)
            .field("configuration", &self.usb_config)
            .field("interface", &self.usb_interface)
            .field("alt_interface", &self.usb_alt_interface)
            .field("events", &self.events)
            .field("usbtmc", &self.tmc)
            .finish()
    }
}

/// Opens sessions on a host stack with a given configuration
pub struct Connector<H: HostStack, S: Sleeper = ThreadSleeper> {
    host: H,
    config: Config,
    sleeper: S,
}

impl<H: HostStack> Connector<H> {
    pub fn new(host: H, config: Config) -> Self {
        Connector {
            host,
            config,
            sleeper: ThreadSleeper,
        }
    }
}

impl<H: HostStack, S: Sleeper> Connector<H, S> {
    /// Use `sleeper` for the pauses between attempts
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> Connector<H, T> {
        Connector {
            host: self.host,
            config: self.config,
            sleeper,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the device identified by `ecid`, or the first matching device
    /// when `ecid` is 0
    pub fn open_with_ecid(&self, ecid: u64) -> Result<Session<H>> {
        self.config.validate()?;

        let service = matcher::find(
            &self.host,
            self.config.vendor_id,
            self.config.product_id,
            ecid,
            &self.config.ecid_token,
        )?;

        Session::open_service(service, ecid, self.config.clone())
    }

    /// Like [`Connector::open_with_ecid`], up to `attempts` times with the
    /// configured pause after each failure
    pub fn open_with_ecid_and_attempts(&self, ecid: u64, attempts: u32) -> Result<Session<H>> {
        self.open_with_retry(ecid, self.config.open_retry.with_attempts(attempts))
    }

    pub fn open_with_retry(&self, ecid: u64, policy: RetryPolicy) -> Result<Session<H>> {
        self.config.validate()?;

        for attempt in 1..=policy.attempts {
            match self.open_with_ecid(ecid) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    debug!(
                        attempt,
                        "connection failed ({}), waiting {:?} before retry",
                        e,
                        policy.delay
                    );
                    self.sleeper.sleep(policy.delay);
                }
            }
        }

        Err(Error::UnableToConnect)
    }

    /// Close `session` and open the same device again.
    ///
    /// The progress callback moves over to the new session. Returns `None`
    /// when the device did not come back, which callers should treat as a
    /// lost connection.
    pub fn reconnect(&self, mut session: Session<H>, initial_pause: Duration) -> Option<Session<H>> {
        let progress = session.event_unsubscribe(EventType::Progress);
        let ecid = session.ecid();

        session.close();
        drop(session);

        if !initial_pause.is_zero() {
            debug!("waiting {:?} for the device to pop up", initial_pause);
            self.sleeper.sleep(initial_pause);
        }

        let mut new_session = match self.open_with_ecid_and_attempts(ecid, self.config.reconnect_attempts) {
            Ok(s) => s,
            Err(e) => {
                warn!("reconnect failed: {}", e);
                return None;
            }
        };

        if let Some(callback) = progress {
            new_session.install_callback(EventType::Progress, callback);
        }

        Some(new_session)
    }
}

impl<H: HostStack, S: Sleeper> fmt::Debug for Connector<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.config)
            .finish()
    }
}
