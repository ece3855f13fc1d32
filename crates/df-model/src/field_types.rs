//! Field value types with strict parsing.
//!
//! Every field type used by a northbound schema parses from its stored string
//! form and fails loudly on bad input. Nothing here falls back to a default
//! value when a stored value does not parse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// Largest value representable in the 20-bit MPLS label field.
pub const MAX_MPLS_LABEL: u32 = 1_048_575;

/// Errors raised while parsing a single field value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP network (expected CIDR): {0}")]
    InvalidIpNetwork(String),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid MPLS label {0}, max is {MAX_MPLS_LABEL}")]
    InvalidMplsLabel(u64),
}

/// A 48-bit Ethernet MAC address.
///
/// ```
/// use df_model::MacAddress;
///
/// let mac: MacAddress = "fa:16:3e:00:00:01".parse().unwrap();
/// assert_eq!(mac.to_string(), "fa:16:3e:00:00:01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Packs the address into the low 48 bits of a `u64`, the form used by
    /// register-move actions on the device.
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains('-') { '-' } else { ':' };
        let mut bytes = [0u8; 6];
        let mut count = 0;

        for part in s.split(separator) {
            if count == 6 || part.len() != 2 {
                return Err(ParseError::InvalidMacAddress(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMacAddress(s.to_string()))?;
            count += 1;
        }

        if count != 6 {
            return Err(ParseError::InvalidMacAddress(s.to_string()));
        }
        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

/// Parses an IP address field.
pub fn parse_ip_address(s: &str) -> Result<IpAddr, ParseError> {
    s.trim()
        .parse()
        .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
}

/// Parses an IP network field.
///
/// Only CIDR notation is accepted. A bare address is rejected instead of being
/// widened to a host route, and host bits are preserved (`10.0.0.1/24` keeps
/// its interface address).
pub fn parse_ip_network(s: &str) -> Result<IpNet, ParseError> {
    s.trim()
        .parse()
        .map_err(|_| ParseError::InvalidIpNetwork(s.to_string()))
}

/// Validates an MPLS label value.
pub fn check_mpls_label(value: u64) -> Result<u32, ParseError> {
    u32::try_from(value)
        .ok()
        .filter(|label| *label <= MAX_MPLS_LABEL)
        .ok_or(ParseError::InvalidMplsLabel(value))
}
