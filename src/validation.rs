//! Name and address validation for operator-supplied input.
//!
//! Device names travel in the 16 byte Config name field (15 usable bytes), so
//! they are checked in bytes, not characters. Aquarium names never go over the
//! air and get a looser limit.

use crate::errors::ValidationError;
use crate::protocol::{MacAddress, MAX_NODE_NAME_LEN};

/// Aquarium names are only stored on the hub.
pub const MAX_AQUARIUM_NAME_LEN: usize = 48;

fn validate_name(name: &str, max_bytes: usize) -> Result<String, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.trim() != name {
        return Err(ValidationError::InvalidWhitespace);
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacters);
    }
    if name.len() > max_bytes {
        return Err(ValidationError::TooLong { max: max_bytes });
    }
    Ok(name.to_string())
}

/// Validate a device display name so it survives the Config frame intact.
pub fn validate_device_name(name: &str) -> Result<String, ValidationError> {
    validate_name(name, MAX_NODE_NAME_LEN - 1)
}

pub fn validate_aquarium_name(name: &str) -> Result<String, ValidationError> {
    validate_name(name, MAX_AQUARIUM_NAME_LEN)
}

/// Parse an operator-supplied MAC; the broadcast address is never a device.
pub fn parse_device_mac(s: &str) -> Result<MacAddress, ValidationError> {
    let mac: MacAddress = s.parse()?;
    if mac.is_broadcast() {
        return Err(ValidationError::InvalidMac(s.to_string()));
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names() {
        assert_eq!(validate_device_name("CO2 Left").unwrap(), "CO2 Left");
        assert_eq!(validate_device_name(""), Err(ValidationError::Empty));
        assert_eq!(
            validate_device_name(" Heater"),
            Err(ValidationError::InvalidWhitespace)
        );
        assert_eq!(
            validate_device_name("Heat\ner"),
            Err(ValidationError::ControlCharacters)
        );
        assert_eq!(
            validate_device_name("Sixteen-chars-xx"),
            Err(ValidationError::TooLong { max: 15 })
        );
        // 7 two-byte characters = 14 bytes
        assert!(validate_device_name("ÄÖÜäöüß").is_ok());
    }

    #[test]
    fn aquarium_names_allow_longer_values() {
        assert!(validate_aquarium_name("Living Room Planted 120L").is_ok());
        assert!(validate_aquarium_name(&"x".repeat(49)).is_err());
    }

    #[test]
    fn device_mac_rejects_broadcast() {
        assert!(parse_device_mac("24:6F:28:AA:BB:CC").is_ok());
        assert!(parse_device_mac("FF:FF:FF:FF:FF:FF").is_err());
        assert!(parse_device_mac("nonsense").is_err());
    }
}
