//! Bluetooth device addresses
//!
//! Fixed six-byte endpoint identifier, totally ordered by byte-wise
//! comparison so it can key the active-session map. The all-zero address
//! means "no device".

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Length of a device address in bytes
pub const ADDRESS_LEN: usize = 6;

/// Fixed-size wireless endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub [u8; ADDRESS_LEN]);

impl DeviceAddress {
    /// The all-zero address, meaning "no device"
    pub const EMPTY: DeviceAddress = DeviceAddress([0; ADDRESS_LEN]);

    pub fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        DeviceAddress(bytes)
    }

    /// True if this is the all-zero "no device" address
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; ADDRESS_LEN];
        let parts: Vec<&str> = s.split(':').collect();

        if parts.len() != ADDRESS_LEN {
            return Err(Error::InvalidAddress(s.to_string()));
        }

        for (byte, part) in bytes.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        }

        Ok(DeviceAddress(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_wise_ordering() {
        let a = DeviceAddress([0, 0, 0, 0, 0, 1]);
        let b = DeviceAddress([0, 0, 0, 0, 1, 0]);
        let c = DeviceAddress([0xff, 0, 0, 0, 0, 0]);

        assert!(a < b);
        assert!(b < c);
        assert!(DeviceAddress::EMPTY < a);
    }

    #[test]
    fn test_display_parse_round_trip() {
        let addr = DeviceAddress([0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]);
        let text = addr.to_string();

        assert_eq!(text, "de:ad:be:ef:01:02");
        assert_eq!(text.parse::<DeviceAddress>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("de:ad:be:ef:01".parse::<DeviceAddress>().is_err());
        assert!("de:ad:be:ef:01:zz".parse::<DeviceAddress>().is_err());
        assert!("".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_empty_address() {
        assert!(DeviceAddress::EMPTY.is_empty());
        assert!(!DeviceAddress([1, 0, 0, 0, 0, 0]).is_empty());
        assert_eq!(DeviceAddress::default(), DeviceAddress::EMPTY);
    }
}
