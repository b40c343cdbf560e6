/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Per-session event callbacks

use crate::error::Error;
use crate::session::SessionId;
use std::convert::TryFrom;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventType {
    Received = 1,
    PreCommand = 2,
    PostCommand = 3,
    Connected = 4,
    Disconnected = 5,
    Progress = 6,
}

const SLOTS: usize = 6;

impl EventType {
    fn slot(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<i32> for EventType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(EventType::Received),
            2 => Ok(EventType::PreCommand),
            3 => Ok(EventType::PostCommand),
            4 => Ok(EventType::Connected),
            5 => Ok(EventType::Disconnected),
            6 => Ok(EventType::Progress),
            _ => Err(Error::InvalidInput),
        }
    }
}

/// Built right before a callback runs and gone once it returns
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event<'a> {
    pub event_type: EventType,
    pub session: SessionId,
    pub size: usize,
    pub data: Option<&'a [u8]>,
    /// fraction in `[0, 1]`, only meaningful for [`EventType::Progress`]
    pub progress: f64,
}

impl<'a> Event<'a> {
    pub fn new(event_type: EventType, session: SessionId) -> Self {
        Event {
            event_type,
            session,
            size: 0,
            data: None,
            progress: 0.0,
        }
    }

    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.size = data.len();
        self.data = Some(data);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }
}

pub type EventCallback = Box<dyn FnMut(&Event<'_>) + Send>;

/// One callback slot per event type
#[derive(Default)]
pub struct EventRegistry {
    slots: [Option<EventCallback>; SLOTS],
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` for `event_type`, returning the one it replaces
    pub fn subscribe(
        &mut self,
        event_type: EventType,
        callback: EventCallback,
    ) -> Option<EventCallback> {
        self.slots[event_type.slot()].replace(callback)
    }

    pub fn unsubscribe(&mut self, event_type: EventType) -> Option<EventCallback> {
        self.slots[event_type.slot()].take()
    }

    pub fn is_subscribed(&self, event_type: EventType) -> bool {
        self.slots[event_type.slot()].is_some()
    }

    /// Run the callback registered for the event's type, if any. Returns
    /// whether a callback ran.
    pub fn fire(&mut self, event: &Event<'_>) -> bool {
        match self.slots[event.event_type.slot()].as_mut() {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let subscribed: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i + 1)
            .collect();

        f.debug_struct("EventRegistry")
            .field("subscribed", &subscribed)
            .finish()
    }
}
