//! Input validation for phone numbers, SMS bodies and on-disk record paths.

use std::path::{Path, PathBuf};

/// Longest number accepted, counting a leading `+`.
pub const MAX_PHONE_LEN: usize = 20;
/// Shortest number accepted; carrier short codes such as `10086` must pass.
pub const MIN_PHONE_LEN: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid record ID: must be a UUID")]
    InvalidRecordId,

    #[error("Invalid phone number: {reason}")]
    InvalidPhoneNumber { reason: String },

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Content too long (max {max_length} bytes)")]
    ContentTooLong { max_length: usize },

    #[error("File size exceeds limit ({limit} bytes)")]
    FileSizeExceeded { limit: usize },

    #[error("Invalid path or path traversal attempt")]
    InvalidPath,

    #[error("Invalid format")]
    InvalidFormat,

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Validate a record ID (must be a UUID) and return it in canonical hyphenated form.
pub fn validate_record_id(id: &str) -> Result<String, ValidationError> {
    uuid::Uuid::parse_str(id.trim())
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| ValidationError::InvalidRecordId)
}

/// Validate a destination or peer number. Spaces and dashes are stripped;
/// what remains must be digits with an optional leading `+`.
pub fn validate_phone_number(number: &str) -> Result<String, ValidationError> {
    let cleaned: String = number
        .trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '-')
        .collect();

    if cleaned.is_empty() {
        return Err(ValidationError::InvalidPhoneNumber {
            reason: "empty".to_string(),
        });
    }
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidPhoneNumber {
            reason: "only digits and a leading + are allowed".to_string(),
        });
    }
    if digits.len() < MIN_PHONE_LEN || cleaned.len() > MAX_PHONE_LEN {
        return Err(ValidationError::InvalidPhoneNumber {
            reason: format!("length must be {}..={}", MIN_PHONE_LEN, MAX_PHONE_LEN),
        });
    }
    Ok(cleaned)
}

/// Longest conversation peer accepted in a lookup.
pub const MAX_PEER_LEN: usize = 128;

/// Check a conversation peer as stored: the sender exactly as the device
/// reported it, which may be alphanumeric or contain spaces. Only empty,
/// over-long or control-character values are refused.
pub fn validate_peer(peer: &str) -> Result<&str, ValidationError> {
    let reason = if peer.is_empty() {
        "empty"
    } else if peer.len() > MAX_PEER_LEN {
        "too long"
    } else if peer.chars().any(char::is_control) {
        "control characters are not allowed"
    } else {
        return Ok(peer);
    };
    Err(ValidationError::InvalidField {
        field: "peer",
        reason: reason.to_string(),
    })
}

/// Strip control characters (newlines and tabs survive) and enforce a byte limit.
pub fn sanitize_sms_content(content: &str, max_bytes: usize) -> Result<String, ValidationError> {
    if content.len() > max_bytes {
        return Err(ValidationError::ContentTooLong {
            max_length: max_bytes,
        });
    }

    let sanitized: String = content
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect();

    if sanitized.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    Ok(sanitized)
}

pub fn validate_file_size(size: u64, max_size: u64) -> Result<(), ValidationError> {
    if size > max_size {
        return Err(ValidationError::FileSizeExceeded {
            limit: max_size as usize,
        });
    }
    Ok(())
}

/// `<data_dir>/<collection>/<uuid>.json`
pub fn secure_record_path(
    data_dir: &Path,
    collection: &str,
    id: &str,
) -> Result<PathBuf, ValidationError> {
    if collection.is_empty() || !collection.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::InvalidPath);
    }
    let id = validate_record_id(id)?;
    let path = data_dir.join(collection).join(format!("{}.json", id));
    if !path.starts_with(data_dir) {
        return Err(ValidationError::InvalidPath);
    }
    Ok(path)
}

/// Parse JSON read from disk with a size cap.
pub fn secure_json_parse<T>(content: &str, max_bytes: usize) -> Result<T, ValidationError>
where
    T: serde::de::DeserializeOwned,
{
    if content.len() > max_bytes {
        return Err(ValidationError::FileSizeExceeded { limit: max_bytes });
    }

    // Interrupted writes have been seen to leave leading NULs.
    let normalized = content.trim_start_matches('\0');

    serde_json::from_str(normalized).map_err(|_| ValidationError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_validation() {
        let valid = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(validate_record_id(valid).unwrap(), valid);
        assert_eq!(
            validate_record_id(" 550E8400-E29B-41D4-A716-446655440000 ").unwrap(),
            valid
        );

        assert!(validate_record_id("../secret").is_err());
        assert!(validate_record_id("message.txt").is_err());
        assert!(validate_record_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_peer_validation_keeps_sender_verbatim() {
        assert_eq!(validate_peer("AMAZON").unwrap(), "AMAZON");
        assert_eq!(validate_peer("+86 138 0013 8000").unwrap(), "+86 138 0013 8000");
        assert!(validate_peer("").is_err());
        assert!(validate_peer("a\nb").is_err());
        assert!(validate_peer(&"x".repeat(MAX_PEER_LEN + 1)).is_err());
    }

    #[test]
    fn test_phone_number_validation() {
        assert_eq!(validate_phone_number("10086").unwrap(), "10086");
        assert_eq!(validate_phone_number("+86 138-0013-8000").unwrap(), "+8613800138000");

        assert!(validate_phone_number("").is_err());
        assert!(validate_phone_number("12").is_err());
        assert!(validate_phone_number("abc123").is_err());
        assert!(validate_phone_number("++123").is_err());
        assert!(validate_phone_number("../../etc").is_err());
        assert!(validate_phone_number(&"1".repeat(25)).is_err());
    }

    #[test]
    fn test_content_sanitization() {
        assert_eq!(sanitize_sms_content("Hello world!", 100).unwrap(), "Hello world!");

        let multiline = "Line 1\nLine 2\tTabbed";
        assert_eq!(sanitize_sms_content(multiline, 100).unwrap(), multiline);

        assert_eq!(sanitize_sms_content("Hello\x00\x01World", 100).unwrap(), "HelloWorld");

        assert_eq!(sanitize_sms_content("  \x07 ", 100), Err(ValidationError::EmptyContent));
        assert!(sanitize_sms_content(&"a".repeat(1000), 100).is_err());
    }

    #[test]
    fn test_secure_path_construction() {
        let data_dir = Path::new("/tmp/sms_data");
        let path = secure_record_path(data_dir, "messages", "550e8400-e29b-41d4-a716-446655440000")
            .unwrap();
        assert_eq!(
            path,
            Path::new("/tmp/sms_data/messages/550e8400-e29b-41d4-a716-446655440000.json")
        );

        assert!(secure_record_path(data_dir, "../etc", "550e8400-e29b-41d4-a716-446655440000").is_err());
        assert!(secure_record_path(data_dir, "messages", "../secret").is_err());
    }

    #[test]
    fn test_secure_json_parse() {
        let v: serde_json::Value = secure_json_parse("\0\0{\"a\":1}", 100).unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(
            secure_json_parse::<serde_json::Value>("{\"a\":1}", 3).unwrap_err(),
            ValidationError::FileSizeExceeded { limit: 3 }
        );
        assert_eq!(
            secure_json_parse::<serde_json::Value>("{", 100).unwrap_err(),
            ValidationError::InvalidFormat
        );
    }
}
