//! Bluetooth device addresses

use std::fmt;
use std::str::FromStr;

use crate::error::ErrorKind;
use crate::Error;

/// A 48-bit Bluetooth device address (`BD_ADDR`), written `AA:BB:CC:DD:EE:FF`.
///
/// Together with the adapter name, the address is the identity of a [`Device`][crate::Device] within a
/// [`DeviceManager`][crate::DeviceManager]. Bus objects for the same peer may come and go (e.g. across adapter power
/// cycles) but the address stays the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Creates an address from its six octets, most significant first.
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }

    /// The address octets, most significant first.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The object path segment the management service uses for this address, e.g. `dev_AA_BB_CC_DD_EE_FF`.
    pub fn path_segment(&self) -> String {
        let [a, b, c, d, e, f] = self.0;
        format!("dev_{a:02X}_{b:02X}_{c:02X}_{d:02X}_{e:02X}_{f:02X}")
    }

    /// Parses an object path segment of the form `dev_AA_BB_CC_DD_EE_FF`.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        let hex = segment.strip_prefix("dev_")?;
        parse_octets(hex, '_')
    }
}

fn parse_octets(s: &str, separator: char) -> Option<MacAddress> {
    let mut octets = [0u8; 6];
    let mut parts = s.split(separator);
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *octet = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(MacAddress(octets))
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Parses `AA:BB:CC:DD:EE:FF`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_octets(s, ':')
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidParameter, format!("invalid MAC address {s:?}")))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }
}

impl From<MacAddress> for [u8; 6] {
    fn from(address: MacAddress) -> Self {
        address.0
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
