//! IPv6 → IPv4 address synthesis.
//!
//! The relay's listener-side destination address carries the IPv4 target in
//! its last four groups, written so that each group *reads* as a decimal
//! octet when printed in expanded form:
//!
//! ```text
//! 2001:db8:0:0:0192:0168:0001:0001  →  192.168.1.1
//! 2001:db8::93:184:216:34          →  93.184.216.34
//! ```
//!
//! Groups are interpreted as decimal digits after stripping leading zeros,
//! not converted from hex. A group containing `a`–`f` (e.g. `00ff`) does not
//! translate. External systems generate destinations in this form, so the
//! scheme must stay exactly as it is.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

/// Number of trailing IPv6 groups that carry the embedded IPv4 address.
const EMBEDDED_GROUPS: usize = 4;

/// Why an address could not be translated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// The expanded form of an IPv4 address has no groups to read from.
    #[error("{0} is not an IPv6 address")]
    NotIpv6(IpAddr),

    /// The group contains a hex digit that has no decimal reading.
    #[error("group {index} ({group}) is not a decimal number")]
    NonDecimalGroup { index: usize, group: String },

    /// The group reads as a decimal number larger than an octet.
    #[error("group {index} ({group}) reads as {value}, outside 0-255")]
    OctetOutOfRange {
        index: usize,
        group: String,
        value: u16,
    },
}

/// Synthesize the IPv4 target embedded in `addr`.
///
/// # Errors
///
/// Returns [`TranslateError`] for IPv4 input, for any of the last four groups
/// containing a non-decimal digit, and for any group reading above 255.
pub fn translate(addr: IpAddr) -> Result<Ipv4Addr, TranslateError> {
    let v6 = match addr {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return Err(TranslateError::NotIpv6(addr)),
    };

    let segments = v6.segments();
    let embedded = &segments[segments.len() - EMBEDDED_GROUPS..];

    let mut octets = [0u8; EMBEDDED_GROUPS];
    for (index, (segment, octet)) in embedded.iter().zip(octets.iter_mut()).enumerate() {
        *octet = read_decimal_group(index, *segment)?;
    }

    Ok(Ipv4Addr::from(octets))
}

/// Translate the listener-side endpoint of a connection. The port is carried
/// over unchanged.
pub fn translate_endpoint(local: SocketAddr) -> Result<SocketAddrV4, TranslateError> {
    let ip = translate(local.ip())?;
    Ok(SocketAddrV4::new(ip, local.port()))
}

/// Read one group the way it is printed in expanded form (`{:04x}`), with
/// leading zeros stripped, as a decimal number.
fn read_decimal_group(index: usize, segment: u16) -> Result<u8, TranslateError> {
    let group = format!("{segment:04x}");
    let digits = match group.trim_start_matches('0') {
        "" => "0",
        rest => rest,
    };

    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TranslateError::NonDecimalGroup { index, group });
    }

    // At most four decimal digits, so this always fits.
    let value: u16 = digits
        .parse()
        .map_err(|_| TranslateError::NonDecimalGroup {
            index,
            group: group.clone(),
        })?;

    u8::try_from(value).map_err(|_| TranslateError::OctetOutOfRange {
        index,
        group,
        value,
    })
}
