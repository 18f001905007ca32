//! Bluetooth GATT UUIDs.

use core::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A 128-bit UUID identifying a GATT service, characteristic or descriptor.
///
/// # Construction
///
/// [`GattUuid`] parses three input forms via [`FromStr`]:
///
/// * `"2A29"` (a 16-bit Bluetooth SIG alias),
/// * `"0000180A"` (a 32-bit alias),
/// * `"00002A29-0000-1000-8000-00805F9B34FB"` (the full 36-character form).
///
/// Short aliases are canonicalised onto the Bluetooth base UUID
/// (`0000XXXX-0000-1000-8000-00805F9B34FB`). The [`fmt::Display`]
/// implementation always renders the canonical 128-bit form, uppercase,
/// without braces, which is the spelling BlueZ reports in its `UUID`
/// properties.
///
/// Compile-time constants can be built with [`GattUuid::from_u16`] and
/// [`GattUuid::from_static`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattUuid([u8; 16]);

impl GattUuid {
    /// The Bluetooth SIG base UUID onto which short aliases are grafted.
    const BASE: [u8; 16] = [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34,
        0xFB,
    ];

    /// Creates a [`GattUuid`] from a 16-bit Bluetooth SIG alias.
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Creates a [`GattUuid`] from a 32-bit Bluetooth SIG alias.
    pub const fn from_u32(short: u32) -> Self {
        let [b0, b1, b2, b3] = short.to_be_bytes();
        let mut uuid = Self::BASE;
        uuid[0] = b0;
        uuid[1] = b1;
        uuid[2] = b2;
        uuid[3] = b3;
        Self(uuid)
    }

    /// Creates a [`GattUuid`] from a static string, panicking on malformed
    /// input. This is typically what you want for `const`-adjacent UUIDs in
    /// service definitions.
    pub fn from_static(s: &'static str) -> Self {
        match s.parse() {
            Ok(uuid) => uuid,
            Err(_) => panic!("malformed UUID literal"),
        }
    }

    /// Returns the raw big-endian bytes of the canonical 128-bit form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the 16-bit alias if this UUID lies in the Bluetooth SIG
    /// base range with a zero high word, or `None` for custom UUIDs.
    ///
    /// Only UUIDs for which this returns `Some` fit the legacy 31-byte
    /// advertising payload; see the advertising payload policy.
    pub fn as_u16(&self) -> Option<u16> {
        let mut base_check = self.0;
        base_check[2] = 0;
        base_check[3] = 0;
        if base_check == Self::BASE {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }
}

impl FromStr for GattUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            4 => Ok(Self::from_u32(parse_hex(s)?)),
            8 => Ok(Self::from_u32(parse_hex(s)?)),
            36 => parse_full(s),
            _ => Err(Error::InvalidUuid(s.to_string())),
        }
    }
}

fn parse_hex(s: &str) -> Result<u32, Error> {
    // from_str_radix tolerates a leading sign, which is not a valid alias.
    if !s.bytes().all(|b| hex_nibble(b).is_some()) {
        return Err(Error::InvalidUuid(s.to_string()));
    }
    u32::from_str_radix(s, 16).map_err(|_| Error::InvalidUuid(s.to_string()))
}

fn parse_full(s: &str) -> Result<GattUuid, Error> {
    // Caller guarantees len == 36. Hyphens sit at the standard 8-4-4-4-12
    // positions; everything else is hex pairs.
    let bytes = s.as_bytes();
    let mut out = [0u8; 16];
    let mut oi = 0;
    let mut i = 0;
    while i < 36 {
        if matches!(i, 8 | 13 | 18 | 23) {
            if bytes[i] != b'-' {
                return Err(Error::InvalidUuid(s.to_string()));
            }
            i += 1;
            continue;
        }
        let hi = hex_nibble(bytes[i]).ok_or_else(|| Error::InvalidUuid(s.to_string()))?;
        let lo = hex_nibble(bytes[i + 1]).ok_or_else(|| Error::InvalidUuid(s.to_string()))?;
        out[oi] = (hi << 4) | lo;
        oi += 1;
        i += 2;
    }

    Ok(GattUuid(out))
}

fn hex_nibble(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6],
            self.0[7], self.0[8], self.0[9], self.0[10], self.0[11], self.0[12], self.0[13],
            self.0[14], self.0[15],
        )
    }
}

impl fmt::Debug for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_aliases_canonicalise_onto_the_base() {
        let uuid: GattUuid = "2A29".parse().unwrap();
        assert_eq!(uuid.to_string(), "00002A29-0000-1000-8000-00805F9B34FB");
        assert_eq!(uuid, GattUuid::from_u16(0x2A29));
        assert_eq!(uuid.as_u16(), Some(0x2A29));

        let uuid: GattUuid = "0000180A".parse().unwrap();
        assert_eq!(uuid.to_string(), "0000180A-0000-1000-8000-00805F9B34FB");
        assert_eq!(uuid.as_u16(), Some(0x180A));
    }

    #[test]
    fn full_form_roundtrips_and_is_case_insensitive() {
        let s = "00000002-1E3C-FAD4-74E2-97A033F1BFAA";
        let uuid: GattUuid = s.parse().unwrap();
        assert_eq!(uuid.to_string(), s);
        assert_eq!(uuid.as_u16(), None);

        let lower: GattUuid = s.to_lowercase().parse().unwrap();
        assert_eq!(lower, uuid);
    }

    #[test]
    fn reparse_of_canonical_form_is_idempotent() {
        for s in ["180F", "2A19", "0000B002", "00000001-1E3D-FAD4-74E2-97A033F1BFEE"] {
            let uuid: GattUuid = s.parse().unwrap();
            let again: GattUuid = uuid.to_string().parse().unwrap();
            assert_eq!(uuid, again);
        }
    }

    #[test]
    fn malformed_input_is_rejected() {
        for s in [
            "",
            "xyz",
            "12345",
            "2A2",
            "00002A29-0000-1000-8000-00805F9B34F", // one short
            "00002A29_0000_1000_8000_00805F9B34FB",
            "00002A29-0000-1000-800000805F9B34FBx",
            "{00002A29-0000-1000-8000-00805F9B34FB}",
        ] {
            assert!(s.parse::<GattUuid>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn base_uuid_detection_requires_exact_suffix() {
        let custom: GattUuid = "00002A29-0000-1000-8000-00805F9B34FC".parse().unwrap();
        assert_eq!(custom.as_u16(), None);
    }
}
