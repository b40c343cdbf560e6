/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! USBTMC device dependent message exchange
//!
//! Messages larger than the I/O buffer are split in several bulk transfers,
//! each prefixed by its own 12 byte header and identified by a fresh bTag.

use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::host::HostStack;
use crate::session::Session;
use std::cmp::min;
use std::num::{NonZeroU8, Wrapping};
use tracing::{debug, warn};

/// Size of the bulk message header
pub const HEADER_SIZE: usize = 12;

/// Room kept free for the header and up to 3 alignment bytes of a response
const IN_RESERVED: usize = HEADER_SIZE + 3;

/* bulk values */

/// USBTMC MsgID values
const DEV_DEP_MSG_OUT: u8 = 1;
const REQUEST_DEV_DEP_MSG_IN: u8 = 2;

const DEFAULT_TERM_CHAR: u8 = b'\n';

/// Transaction identifier of a bulk message. Never 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BTag(NonZeroU8);

impl BTag {
    pub const FIRST: BTag = match NonZeroU8::new(1) {
        Some(n) => BTag(n),
        None => unreachable!(),
    };

    pub fn new(value: u8) -> Option<BTag> {
        NonZeroU8::new(value).map(BTag)
    }

    pub fn get(self) -> u8 {
        self.0.get()
    }

    /// Following tag, wrapping from 255 to 1
    pub fn next(self) -> BTag {
        let next = Wrapping(self.get()) + Wrapping(1_u8);
        BTag::new(next.0).unwrap_or(BTag::FIRST)
    }
}

impl Default for BTag {
    fn default() -> Self {
        BTag::FIRST
    }
}

/// Bulk-OUT messages sent to the instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkOut {
    /// Device dependent command data
    DevDepMsgOut { end_of_message: bool },
    /// Ask the instrument for up to `transfer_size` bytes of response
    RequestDevDepMsgIn { term_char_enabled: bool, term_char: u8 },
}

/// helper function to create bulk headers
pub fn make_bulk_header(message: BulkOut, btag: BTag, transfer_size: u32) -> [u8; HEADER_SIZE] {
    let (msgid, attributes, term_char) = match message {
        BulkOut::DevDepMsgOut { end_of_message } => (DEV_DEP_MSG_OUT, u8::from(end_of_message), 0),
        BulkOut::RequestDevDepMsgIn {
            term_char_enabled,
            term_char,
        } => (REQUEST_DEV_DEP_MSG_IN, u8::from(term_char_enabled) * 2, term_char),
    };

    let ts_bytes = transfer_size.to_le_bytes();
    [
        msgid,
        btag.get(),
        !btag.get(),
        0x00,
        // size of the transfer, without header
        ts_bytes[0],
        ts_bytes[1],
        ts_bytes[2],
        ts_bytes[3],
        attributes,
        term_char,
        // reserved, must be zeroes
        0x00,
        0x00,
    ]
}

/// Length rounded up to the next multiple of 4
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Number of payload bytes announced by a DEV_DEP_MSG_IN response
pub fn response_transfer_size(response: &[u8]) -> Option<u32> {
    if response.len() < HEADER_SIZE {
        return None;
    }

    Some(u32::from_le_bytes([
        response[4],
        response[5],
        response[6],
        response[7],
    ]))
}

/// Protocol state kept per session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbtmcState {
    btag: BTag,
    term_char: u8,
    term_char_enabled: bool,
    last_write_btag: Option<BTag>,
    last_read_btag: Option<BTag>,
    /// bytes delivered by the last read, cleared by a write
    last_read_len: usize,
}

impl Default for UsbtmcState {
    fn default() -> Self {
        UsbtmcState {
            btag: BTag::FIRST,
            term_char: DEFAULT_TERM_CHAR,
            term_char_enabled: false,
            last_write_btag: None,
            last_read_btag: None,
            last_read_len: 0,
        }
    }
}

impl UsbtmcState {
    /// Hand out the current tag and move to the next one
    fn take_btag(&mut self) -> BTag {
        let btag = self.btag;
        self.btag = btag.next();
        btag
    }
}

impl<H: HostStack> Session<H> {
    /// Reset the protocol state: bTag back to 1, term char `'\n'` disabled
    pub fn usbtmc_init(&mut self) {
        self.tmc = UsbtmcState::default();
    }

    pub fn btag(&self) -> BTag {
        self.tmc.btag
    }

    pub fn last_write_btag(&self) -> Option<BTag> {
        self.tmc.last_write_btag
    }

    pub fn last_read_btag(&self) -> Option<BTag> {
        self.tmc.last_read_btag
    }

    /// Length of the message delivered by the last read. A write clears it.
    pub fn last_read_len(&self) -> usize {
        self.tmc.last_read_len
    }

    pub fn term_char(&self) -> Option<u8> {
        if self.tmc.term_char_enabled {
            Some(self.tmc.term_char)
        } else {
            None
        }
    }

    /// Ask the instrument to end responses at `term_char`, or not to
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        match term_char {
            Some(c) => {
                self.tmc.term_char = c;
                self.tmc.term_char_enabled = true;
            }
            None => self.tmc.term_char_enabled = false,
        }
    }

    /// Send `data` as one device dependent message.
    ///
    /// Returns the number of payload bytes sent, which is always
    /// `data.len()` on success. A failed chunk aborts the message.
    pub fn usbtmc_write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;

        let endpoint = self.config.bulk_out_endpoint;
        let timeout = self.config.transfer_timeout;
        let max_payload = self.config.io_buffer_size - HEADER_SIZE;
        let count = data.len();

        self.tmc.last_read_len = 0;

        let mut packet = Vec::with_capacity(self.config.io_buffer_size);
        let mut done = 0;

        for chunk in data.chunks(max_payload) {
            let end_of_message = done + chunk.len() == count;
            let btag = self.tmc.btag;

            packet.clear();
            packet.extend_from_slice(&make_bulk_header(
                BulkOut::DevDepMsgOut { end_of_message },
                btag,
                chunk.len() as u32,
            ));
            packet.extend_from_slice(chunk);
            packet.resize(padded_len(packet.len()), 0);

            let sent = self.bulk_transfer(endpoint, &mut packet, timeout);

            self.tmc.last_write_btag = Some(btag);
            self.tmc.take_btag();

            if let Err(e) = sent {
                warn!("failed to send chunk during bulk out: {}", e);
                return Err(e);
            }

            done += chunk.len();

            let id = self.id();
            self.notify(Event::new(EventType::Progress, id).with_progress(done as f64 / count as f64));
        }

        Ok(count)
    }

    /// Read a device dependent message into `buf`.
    ///
    /// Stops once `buf` is full or the instrument sends fewer bytes than
    /// requested. Returns the number of bytes copied.
    pub fn usbtmc_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;

        let out_endpoint = self.config.bulk_out_endpoint;
        let in_endpoint = self.config.bulk_in_endpoint;
        let out_timeout = self.config.transfer_timeout;
        let in_timeout = self.config.read_timeout;
        let max_part = self.config.io_buffer_size - IN_RESERVED;
        let debug = self.config.debug;

        let count = buf.len();
        let mut response = vec![0_u8; self.config.io_buffer_size];
        let mut done = 0;

        while done < count {
            let this_part = min(count - done, max_part);
            let btag = self.tmc.btag;

            let mut request = make_bulk_header(
                BulkOut::RequestDevDepMsgIn {
                    term_char_enabled: self.tmc.term_char_enabled,
                    term_char: self.tmc.term_char,
                },
                btag,
                this_part as u32,
            );

            let sent = self.bulk_transfer(out_endpoint, &mut request, out_timeout);

            self.tmc.last_read_btag = Some(btag);
            self.tmc.take_btag();

            if let Err(e) = sent {
                warn!("failed to request bulk in: {}", e);
                return Err(e);
            }

            let received = match self.bulk_transfer(in_endpoint, &mut response, in_timeout) {
                Ok(n) => n,
                Err(e) => {
                    warn!("failed to receive bulk in: {}", e);
                    return Err(e);
                }
            };

            let announced = match response_transfer_size(&response[..received]) {
                Some(size) => size,
                None => {
                    warn!("short response header ({} bytes)", received);
                    return Err(Error::Pipe);
                }
            };

            if debug && response[1] != btag.get() {
                debug!("response bTag {} does not match request {}", response[1], btag.get());
            }

            let delivered = min(announced as usize, received - HEADER_SIZE);
            let delivered = min(delivered, count - done);

            buf[done..done + delivered]
                .copy_from_slice(&response[HEADER_SIZE..HEADER_SIZE + delivered]);
            done += delivered;

            if delivered < this_part {
                // short packet, end of message
                break;
            }
        }

        self.tmc.last_read_len = done;

        let id = self.id();
        self.notify(Event::new(EventType::Received, id).with_data(&buf[..done]));

        Ok(done)
    }

    /// Write `command` then read the reply into `reply`
    pub fn usbtmc_query(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize> {
        self.check_open()?;

        let id = self.id();
        self.notify(Event::new(EventType::PreCommand, id).with_data(command));

        match self.usbtmc_write(command) {
            Ok(n) if n > 0 => {}
            Ok(_) => {
                warn!("query wrote nothing");
                return Err(Error::Pipe);
            }
            Err(e) => {
                warn!("query write failed: {}", e);
                return Err(Error::Pipe);
            }
        }

        let n = self.usbtmc_read(reply)?;

        self.notify(Event::new(EventType::PostCommand, id).with_data(&reply[..n]));

        Ok(n)
    }

    /// Write a string to the instrument
    pub fn write_str(&mut self, message: &str) -> Result<usize> {
        self.usbtmc_write(message.as_bytes())
    }

    /// Query with a string command and decode the reply as utf-8. At most
    /// `max_len` bytes are read.
    pub fn query_str(&mut self, command: &str, max_len: usize) -> Result<String> {
        let mut reply = vec![0_u8; max_len];
        let n = self.usbtmc_query(command.as_bytes(), &mut reply)?;
        reply.truncate(n);

        String::from_utf8(reply).map_err(|_| Error::InvalidInput)
    }
}
