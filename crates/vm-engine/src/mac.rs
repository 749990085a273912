use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// OUI prefix used for generated addresses, matching what QEMU and most
/// host tooling assign to virtio NICs.
const GENERATED_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// A unicast Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Result<Self, EngineError> {
        if octets[0] & 0x01 != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "MAC address {} is multicast",
                Self(octets)
            )));
        }
        Ok(Self(octets))
    }

    /// Generate a random `52:54:00:xx:xx:xx` address.
    pub fn random() -> Self {
        let entropy = uuid::Uuid::new_v4();
        let bytes = entropy.as_bytes();
        let [a, b, c] = GENERATED_PREFIX;
        Self([a, b, c, bytes[0], bytes[1], bytes[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidConfig(format!("invalid MAC address: {s:?}"));

        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Self::new(octets)
    }
}
