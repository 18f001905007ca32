//! Bluetooth device addresses, as BlueZ spells them.
//!
//! A peripheral never touches addresses on the wire; it only meets the
//! two textual spellings BlueZ uses on the bus. The `Address` property of
//! `org.bluez.Adapter1` and `org.bluez.Device1` carries the
//! colon-separated form (`AA:BB:CC:00:11:22`), and device object paths
//! embed the same six octets underscore-separated in their trailing
//! element (`/org/bluez/hci0/dev_AA_BB_CC_00_11_22`). [`Address`] parses
//! both and always renders the property form.

use core::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A six-octet Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    /// Extracts the address a BlueZ device object path encodes in its
    /// trailing `dev_AA_BB_CC_DD_EE_FF` element.
    ///
    /// Returns `None` for paths that do not name a device (the adapter
    /// path itself, or a malformed tail).
    pub fn from_device_path(path: &str) -> Option<Self> {
        let tail = path.rsplit('/').next()?.strip_prefix("dev_")?;
        Self::parse_octets(tail, '_').ok()
    }

    fn parse_octets(s: &str, separator: char) -> Result<Self, Error> {
        let malformed = || Error::InvalidArgument(format!("malformed device address '{s}'"));

        let mut octets = [0u8; 6];
        let mut parts = s.split(separator);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(octets))
    }
}

/// Parses the colon-separated `Address` property spelling.
impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_octets(s, ':')
    }
}

/// Renders the `Address` property spelling: uppercase hex octets joined
/// by colons.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_spelling_roundtrips_and_normalises_case() {
        let addr: Address = "AA:BB:CC:00:11:22".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:00:11:22");

        let lower: Address = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(lower, addr);
        assert_eq!(lower.to_string(), "AA:BB:CC:00:11:22");
    }

    #[test]
    fn device_paths_yield_the_embedded_address() {
        let addr = Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_00_11_22").unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:00:11:22");
        assert_eq!(addr, "AA:BB:CC:00:11:22".parse().unwrap());
    }

    #[test]
    fn non_device_paths_yield_nothing() {
        for path in [
            "/org/bluez/hci0",
            "/org/bluez/hci0/dev_AA_BB",
            "/org/bluez/hci0/dev_AA_BB_CC_00_11_ZZ",
            "/org/bluez/hci0/dev_AA_BB_CC_00_11_22_33",
            "/com/bzperi/battery/level",
        ] {
            assert!(Address::from_device_path(path).is_none(), "accepted {path:?}");
        }
    }

    #[test]
    fn malformed_property_strings_are_rejected() {
        for s in [
            "",
            "AA:BB:CC:00:11",
            "AA:BB:CC:00:11:2",
            "AA:BB:CC:00:11:223",
            "AA:BB:CC:00:11:22:33",
            "AA:BB:CC:00:11:ZZ",
            "AA_BB_CC_00_11_22",
            "AA:BB:CC:00:11:22 ",
        ] {
            let result = s.parse::<Address>();
            assert!(
                matches!(result, Err(Error::InvalidArgument(_))),
                "accepted {s:?}"
            );
        }
    }
}
