use std::fmt;

use serde::{Deserialize, Serialize};

const ID_PREFIX: &str = "esp32-";

/// Client identifier derived from the station MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let hex: String = mac.iter().map(|byte| format!("{byte:02x}")).collect();
        Self(format!("{ID_PREFIX}{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` (or `-` separated) into raw bytes.
pub fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0_u8; 6];
    let mut parts = value.trim().split([':', '-']);

    for slot in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
