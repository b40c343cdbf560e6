/* usbtmc-session (c) by Nao Pross <np@0hm.ch>
 *
 *
 * usbtmc-session is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Picks one device among the attached candidates

use crate::error::{Error, Result};
use crate::host::{HostStack, Service};
use tracing::{trace, warn};

/// Case-insensitive substring search
fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Find the device to open.
///
/// With `ecid` 0 the first enumerated candidate wins. Otherwise the first
/// candidate whose cached serial number contains `token` is selected.
/// Candidates that are not selected are released.
pub fn find<H: HostStack>(
    host: &H,
    vendor_id: u16,
    product_id: u16,
    ecid: u64,
    token: &str,
) -> Result<H::Service> {
    let services = host.matching_services(vendor_id, product_id).map_err(|e| {
        warn!("failed to enumerate {:04x}:{:04x}: {}", vendor_id, product_id, e);
        Error::UnableToConnect
    })?;

    trace!(
        "{} candidate(s) for {:04x}:{:04x}",
        services.len(),
        vendor_id,
        product_id
    );

    if ecid == 0 {
        return services.into_iter().next().ok_or(Error::UnableToConnect);
    }

    // rejected services are dropped, which releases them
    for service in services {
        match service.serial_number() {
            Some(serial) if contains_ignore_case(&serial, token) => {
                trace!("selected device with serial {}", serial);
                return Ok(service);
            }
            Some(serial) => trace!("rejecting device with serial {}", serial),
            None => trace!("rejecting device without serial number"),
        }
    }

    Err(Error::UnableToConnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_case() {
        assert!(contains_ignore_case("xxHtG99887766", "HTG"));
        assert!(contains_ignore_case("HTG", "htg"));
        assert!(!contains_ignore_case("ABC123", "HTG"));
        assert!(!contains_ignore_case("", "HTG"));
    }
}
