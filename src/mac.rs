//! MAC address parsing and normalization.
//!
//! A device's MAC is its logical identity for the whole access flow. Every
//! representation the NAS or the browser may hand us (`aa:bb:..`, `AA-BB-..`,
//! bare hex) is folded into the lowercase colon form before it touches storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AccessError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Deterministic RADIUS username: 12 lowercase hex digits.
    pub fn username(&self) -> String {
        hex::encode(self.0)
    }

    /// `AA-BB-CC-DD-EE-FF`, the form NASes expect in `Calling-Station-Id`.
    pub fn calling_station_id(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl FromStr for MacAddress {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = match s.len() {
            12 => s.to_string(),
            17 => {
                let sep = s.as_bytes()[2];
                if sep != b':' && sep != b'-' {
                    return Err(invalid(s));
                }
                // Separators must sit at every third position and be consistent.
                for (i, b) in s.bytes().enumerate() {
                    if i % 3 == 2 && b != sep {
                        return Err(invalid(s));
                    }
                }
                s.chars().filter(|c| *c != ':' && *c != '-').collect()
            }
            _ => return Err(invalid(s)),
        };

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(s));
        }

        let mut octets = [0u8; 6];
        hex::decode_to_slice(&digits, &mut octets).map_err(|_| invalid(s))?;
        Ok(MacAddress(octets))
    }
}

fn invalid(s: &str) -> AccessError {
    AccessError::invalid_state(format!("invalid MAC address '{}'", s))
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
