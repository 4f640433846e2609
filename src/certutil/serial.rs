use crate::error::{PkiError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// Octets drawn for a fresh certificate serial.
pub const SERIAL_OCTETS: usize = 20;

/// Canonical storage form: lowercase hex octets joined by `:`.
///
/// Accepts `:` or `-` separators in either case. Compact hex without
/// separators is split into octet pairs, left-padded to an even length.
pub fn normalize_serial(serial: &str) -> String {
    let lowered = serial.trim().replace('-', ":").to_lowercase();
    if lowered.contains(':') || lowered.len() <= 2 {
        return lowered;
    }
    let mut digits: Vec<char> = lowered.chars().collect();
    if digits.len() % 2 == 1 {
        digits.insert(0, '0');
    }
    digits
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Validates and normalizes a caller-supplied serial.
pub fn parse_serial(serial: &str) -> Result<String> {
    let normalized = normalize_serial(serial);
    if normalized.is_empty() {
        return Err(PkiError::user("the serial number must be provided"));
    }
    let bytes = serial_to_bytes(&normalized)
        .ok_or_else(|| PkiError::user(format!("invalid serial number: {serial}")))?;
    Ok(format_serial(&bytes))
}

/// Formats big-endian integer bytes the way serials are stored.
pub fn format_serial(bytes: &[u8]) -> String {
    let trimmed = strip_leading_zeros(bytes);
    trimmed
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn serial_to_bytes(serial: &str) -> Option<Vec<u8>> {
    let compact: String = normalize_serial(serial).chars().filter(|c| *c != ':').collect();
    if compact.is_empty() {
        return None;
    }
    let padded = if compact.len() % 2 == 1 {
        format!("0{compact}")
    } else {
        compact
    };
    hex::decode(padded).ok()
}

/// A positive random serial from the OS CSPRNG.
pub fn random_serial() -> Vec<u8> {
    let mut bytes = [0u8; SERIAL_OCTETS];
    loop {
        OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 0x7f;
        if bytes.iter().any(|b| *b != 0) {
            return strip_leading_zeros(&bytes).to_vec();
        }
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len().saturating_sub(1));
    &bytes[first..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_accepts_dashes_and_case() {
        assert_eq!(normalize_serial("1A-2B-03"), "1a:2b:03");
        assert_eq!(normalize_serial(" 1a:2b:03 "), "1a:2b:03");
        assert_eq!(parse_serial("1A-2B-03").unwrap(), "1a:2b:03");
    }

    #[test]
    fn test_normalize_splits_compact_hex() {
        assert_eq!(normalize_serial("1a2b03"), "1a:2b:03");
        assert_eq!(normalize_serial("A2B03"), "0a:2b:03");
        assert_eq!(normalize_serial("7f"), "7f");
        assert_eq!(parse_serial("1a2b03").unwrap(), "1a:2b:03");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_serial("").is_err());
        assert!(parse_serial("zz:yy").is_err());
    }

    #[test]
    fn test_format_strips_leading_zero_octets() {
        assert_eq!(format_serial(&[0x00, 0x8f, 0x01]), "8f:01");
        assert_eq!(format_serial(&[0x00]), "00");
    }

    #[test]
    fn test_random_serial_is_positive() {
        for _ in 0..32 {
            let serial = random_serial();
            assert!(!serial.is_empty());
            assert!(serial.len() <= SERIAL_OCTETS);
            assert_eq!(serial_to_bytes(&format_serial(&serial)).unwrap(), serial);
        }
    }
}
