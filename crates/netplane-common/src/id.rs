//! Object ID generation and name validation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{NetError, NetResult};

/// Length of a full object ID in hex characters.
pub const ID_LENGTH: usize = 64;

/// Length of the truncated form used in interface and socket names.
pub const SHORT_ID_LENGTH: usize = 12;

static NAME_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$"));

/// Generate a new random object ID.
///
/// The ID is a 64-character hex string built from two UUID v4 values.
#[must_use]
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    hex::encode(bytes)
}

/// Returns a short version of the ID (first 12 characters).
#[must_use]
pub fn short_id(id: &str) -> &str {
    if id.len() <= SHORT_ID_LENGTH {
        id
    } else {
        &id[..SHORT_ID_LENGTH]
    }
}

/// Whether `name` is acceptable as a network or endpoint name.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN
        .as_ref()
        .is_ok_and(|pattern| pattern.is_match(name))
}

/// Validate a network or endpoint name.
///
/// # Errors
///
/// Returns [`NetError::InvalidName`] if the name is empty or malformed.
pub fn validate_name(name: &str) -> NetResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NetError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Validate a caller-provided object ID.
///
/// # Errors
///
/// Returns [`NetError::InvalidId`] if the ID is empty or contains
/// characters other than ASCII alphanumerics.
pub fn validate_id(id: &str) -> NetResult<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NetError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_hex() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), ID_LENGTH);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short() {
        let id = generate_id();
        assert_eq!(short_id(&id).len(), SHORT_ID_LENGTH);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_name("testnetwork"));
        assert!(is_valid_name("my-net.v1"));
        assert!(is_valid_name("net_2"));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a"));
        assert!(!is_valid_name("-net"));
        assert!(!is_valid_name("net/1"));
        assert!(validate_name("bad name").is_err());
    }

    #[test]
    fn ids() {
        assert!(validate_id("abc123").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("abc-123").is_err());
    }
}
