/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Session configuration and retry policy

use crate::error::{Error, Result};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_VENDOR_ID: u16 = 0x049f;
pub const DEFAULT_PRODUCT_ID: u16 = 0x505b;
pub const DEFAULT_ECID_TOKEN: &str = "HTG";

/// Size of the USBTMC I/O buffer. Must be a multiple of 4 and at least as
/// large as the bulk wMaxPacketSize of the device.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 4096;

const MIN_IO_BUFFER_SIZE: usize = 16;

/// Bounded number of attempts with a fixed pause after each failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }

    /// Same delay, different number of attempts
    pub fn with_attempts(self, attempts: u32) -> Self {
        RetryPolicy { attempts, ..self }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 1,
            delay: Duration::from_secs(1),
        }
    }
}

/// Blocking pause used by the retry loops
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Everything a session needs to know before it is opened
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Emit verbose diagnostics for sessions opened with this config
    pub debug: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Substring searched (case-insensitive) in the serial number when an
    /// ECID is requested
    pub ecid_token: String,
    pub configuration: u8,
    pub interface: u8,
    pub alt_interface: u8,
    /// Endpoint carrying DEV_DEP_MSG_OUT and REQUEST_DEV_DEP_MSG_IN
    pub bulk_out_endpoint: u8,
    /// Endpoint carrying DEV_DEP_MSG_IN responses
    pub bulk_in_endpoint: u8,
    pub io_buffer_size: usize,
    /// Control transfers and bulk-out messages
    pub transfer_timeout: Duration,
    /// Bulk-in responses
    pub read_timeout: Duration,
    pub open_retry: RetryPolicy,
    pub reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            ecid_token: DEFAULT_ECID_TOKEN.to_string(),
            configuration: 1,
            interface: 0,
            alt_interface: 0,
            bulk_out_endpoint: 0x04,
            bulk_in_endpoint: 0x81,
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            transfer_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(500),
            open_retry: RetryPolicy::default(),
            reconnect_attempts: 10,
        }
    }
}

impl Config {
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn device(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    pub fn ecid_token(mut self, token: impl Into<String>) -> Self {
        self.ecid_token = token.into();
        self
    }

    pub fn io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.open_retry.delay = delay;
        self
    }

    /// Check the values a session relies on
    pub fn validate(&self) -> Result<()> {
        if self.io_buffer_size < MIN_IO_BUFFER_SIZE || self.io_buffer_size % 4 != 0 {
            return Err(Error::InvalidInput);
        }

        if self.ecid_token.is_empty() {
            return Err(Error::InvalidInput);
        }

        if self.bulk_out_endpoint & crate::host::ENDPOINT_DIRECTION_MASK != 0
            || self.bulk_in_endpoint & crate::host::ENDPOINT_DIRECTION_MASK == 0
        {
            return Err(Error::InvalidInput);
        }

        Ok(())
    }
}
