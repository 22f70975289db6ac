//! Tunnel identifier rules.
//!
//! A tunnel id doubles as the public subdomain label, so it is held to the
//! safe subset of DNS label syntax: lowercase alphanumerics and interior
//! hyphens, 3 to 63 characters.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;
const DEFAULT_LEN: usize = 8;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Why an identifier was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTunnelId {
    #[error("tunnel id cannot be empty")]
    Empty,
    #[error("tunnel id must be at least {MIN_LEN} characters long")]
    TooShort,
    #[error("tunnel id must be no more than {MAX_LEN} characters long")]
    TooLong,
    #[error("tunnel id must be lowercase")]
    Uppercase,
    #[error(
        "tunnel id must contain only lowercase letters, numbers, and hyphens, \
         and cannot start or end with a hyphen"
    )]
    BadFormat,
}

/// Validate an identifier against `^[a-z0-9][a-z0-9-]*[a-z0-9]$`, length 3..63.
pub fn validate(id: &str) -> Result<(), InvalidTunnelId> {
    if id.is_empty() {
        return Err(InvalidTunnelId::Empty);
    }
    if id.len() < MIN_LEN {
        return Err(InvalidTunnelId::TooShort);
    }
    if id.len() > MAX_LEN {
        return Err(InvalidTunnelId::TooLong);
    }
    if id.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(InvalidTunnelId::Uppercase);
    }

    let bytes = id.as_bytes();
    let interior_ok = bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !interior_ok || bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(InvalidTunnelId::BadFormat);
    }

    Ok(())
}

/// Generate a random identifier of the default length.
pub fn generate_default() -> String {
    generate(DEFAULT_LEN).expect("default length is within bounds")
}

/// Generate a random identifier of `len` characters from `[0-9a-z]`.
///
/// Bytes from the CSPRNG are masked to the smallest power-of-two range
/// covering the alphabet and rejection-sampled, so every character is an
/// unbiased draw. The batch size is chosen so one batch usually suffices.
pub fn generate(len: usize) -> Result<String, InvalidTunnelId> {
    if len < MIN_LEN {
        return Err(InvalidTunnelId::TooShort);
    }
    if len > MAX_LEN {
        return Err(InvalidTunnelId::TooLong);
    }

    let mask = ALPHABET.len().next_power_of_two() - 1;
    let step = (1.6 * (mask * len) as f64 / ALPHABET.len() as f64).ceil() as usize;

    let mut id = String::with_capacity(len);
    let mut bytes = vec![0u8; step];
    loop {
        OsRng.fill_bytes(&mut bytes);
        for &byte in &bytes {
            let index = (byte as usize) & mask;
            if index < ALPHABET.len() {
                id.push(ALPHABET[index] as char);
                if id.len() == len {
                    return Ok(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        for id in ["abc", "abc123", "a-b-c", "0x0", "my-tunnel-01"] {
            assert_eq!(validate(id), Ok(()), "{id}");
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate(""), Err(InvalidTunnelId::Empty));
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(validate("ab"), Err(InvalidTunnelId::TooShort));
    }

    #[test]
    fn rejects_too_long() {
        let id = "a".repeat(64);
        assert_eq!(validate(&id), Err(InvalidTunnelId::TooLong));
        assert_eq!(validate(&"a".repeat(63)), Ok(()));
    }

    #[test]
    fn rejects_uppercase() {
        assert_eq!(validate("Abc12"), Err(InvalidTunnelId::Uppercase));
    }

    #[test]
    fn rejects_bad_chars_and_hyphen_boundaries() {
        for id in ["ab_c", "ab.c", "-abc", "abc-", "a b"] {
            assert_eq!(validate(id), Err(InvalidTunnelId::BadFormat), "{id}");
        }
    }

    #[test]
    fn generated_ids_validate() {
        for len in [3, 8, 20, 63] {
            let id = generate(len).unwrap();
            assert_eq!(id.len(), len);
            assert_eq!(validate(&id), Ok(()));
        }
    }

    #[test]
    fn generate_rejects_out_of_range_lengths() {
        assert_eq!(generate(2), Err(InvalidTunnelId::TooShort));
        assert_eq!(generate(64), Err(InvalidTunnelId::TooLong));
    }

    #[test]
    fn generated_ids_use_full_alphabet_only() {
        let id = generate_default();
        assert!(id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate(20).unwrap();
        let b = generate(20).unwrap();
        assert_ne!(a, b);
    }
}
