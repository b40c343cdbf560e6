/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Library error kinds and their numeric codes

use thiserror::Error;

/// Code reported for a successful operation
pub const SUCCESS: i32 = 0;

const SUCCESS_MESSAGE: &str = "Command completed successfully";
const UNKNOWN_MESSAGE: &str = "Unknown error";

/// Every way a public operation can fail.
///
/// Transport failures travel unchanged through the protocol engine and the
/// session manager, so the variant a caller sees is the one the transport
/// produced.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("Unable to find device")]
    NoDevice,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Unable to connect to device")]
    UnableToConnect,
    #[error("Invalid input")]
    InvalidInput,
    #[error("File not found")]
    FileNotFound,
    #[error("Unable to upload data to device")]
    UsbUpload,
    #[error("Unable to get device status")]
    UsbStatus,
    #[error("Unable to set device interface")]
    UsbInterface,
    #[error("Unable to set device configuration")]
    UsbConfiguration,
    #[error("Broken pipe")]
    Pipe,
    #[error("Timeout talking to device")]
    Timeout,
    #[error("Unknown error")]
    UnknownError,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    const ALL: [Error; 12] = [
        Error::NoDevice,
        Error::OutOfMemory,
        Error::UnableToConnect,
        Error::InvalidInput,
        Error::FileNotFound,
        Error::UsbUpload,
        Error::UsbStatus,
        Error::UsbInterface,
        Error::UsbConfiguration,
        Error::Pipe,
        Error::Timeout,
        Error::UnknownError,
    ];

    /// Stable numeric code, negative for every failure
    pub fn code(self) -> i32 {
        match self {
            Error::NoDevice => -1,
            Error::OutOfMemory => -2,
            Error::UnableToConnect => -3,
            Error::InvalidInput => -4,
            Error::FileNotFound => -5,
            Error::UsbUpload => -6,
            Error::UsbStatus => -7,
            Error::UsbInterface => -8,
            Error::UsbConfiguration => -9,
            Error::Pipe => -10,
            Error::Timeout => -11,
            Error::UnknownError => -255,
        }
    }

    /// Inverse of [`Error::code`]. Returns `None` for [`SUCCESS`] and for
    /// codes that name no error.
    pub fn from_code(code: i32) -> Option<Error> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }
}

/// Human readable message for a numeric status code
pub fn strerror(code: i32) -> &'static str {
    if code == SUCCESS {
        return SUCCESS_MESSAGE;
    }

    match Error::from_code(code) {
        // unknown codes and UnknownError share the default text
        Some(e) => error_message(e),
        None => UNKNOWN_MESSAGE,
    }
}

fn error_message(e: Error) -> &'static str {
    match e {
        Error::NoDevice => "Unable to find device",
        Error::OutOfMemory => "Out of memory",
        Error::UnableToConnect => "Unable to connect to device",
        Error::InvalidInput => "Invalid input",
        Error::FileNotFound => "File not found",
        Error::UsbUpload => "Unable to upload data to device",
        Error::UsbStatus => "Unable to get device status",
        Error::UsbInterface => "Unable to set device interface",
        Error::UsbConfiguration => "Unable to set device configuration",
        Error::Pipe => "Broken pipe",
        Error::Timeout => "Timeout talking to device",
        Error::UnknownError => UNKNOWN_MESSAGE,
    }
}
