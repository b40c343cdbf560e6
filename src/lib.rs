/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! USB Test and Measurement Class (USBTMC) sessions
//!
//! A [`Connector`] finds one attached instrument, optionally picking it by
//! the ECID carried in its serial number string, and opens an exclusive
//! [`Session`] on it. Sessions speak USBTMC through
//! [`Session::usbtmc_write`], [`Session::usbtmc_read`] and
//! [`Session::usbtmc_query`], and also expose raw control and bulk
//! transfers.
//!
//! The USB host stack is reached through the traits of [`host`]. [`RusbHost`]
//! talks to real hardware, [`loopback::LoopbackHost`] simulates it.

pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod loopback;
pub mod matcher;
pub mod rusb_host;
pub mod session;
pub mod transport;
pub mod usbtmc;

pub use config::{Config, RetryPolicy, Sleeper, ThreadSleeper};
pub use error::{strerror, Error, Result};
pub use event::{Event, EventCallback, EventType};
pub use host::HostStack;
pub use rusb_host::RusbHost;
pub use session::{Connector, Session, SessionId, SessionState};
pub use usbtmc::BTag;

use tracing::trace;

/// Library setup. Holds no global state for now.
pub fn init() {
    trace!("usbtmc-session init");
}

/// Library teardown, counterpart of [`init`]
pub fn exit() {
    trace!("usbtmc-session exit");
}
