//! Name validation for storage areas and property names.

use std::collections::BTreeSet;

pub const MAX_AREA_NAME: usize = 64;
pub const MAX_PROPERTY_NAME: usize = 128;

/// Name validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("name is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("name cannot start or end with whitespace")]
    InvalidWhitespace,

    #[error("name contains control characters")]
    ControlCharacters,

    #[error("name contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },
}

/// Area names are free text: printable, trimmed, bounded.
pub fn validate_area_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_AREA_NAME {
        return Err(NameError::TooLong { max: MAX_AREA_NAME });
    }
    if name.trim() != name {
        return Err(NameError::InvalidWhitespace);
    }
    if name.chars().any(char::is_control) {
        return Err(NameError::ControlCharacters);
    }
    Ok(name)
}

/// Property names are identifiers: ASCII letters, digits, `_`, `.`, `-`, and a
/// leading `#` for runtime-only properties.
pub fn validate_property_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_PROPERTY_NAME {
        return Err(NameError::TooLong {
            max: MAX_PROPERTY_NAME,
        });
    }
    let body = name.strip_prefix('#').unwrap_or(name);
    let invalid: BTreeSet<char> = body
        .chars()
        .filter(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        .collect();
    if !invalid.is_empty() || body.is_empty() {
        return Err(NameError::InvalidCharacters {
            chars: invalid.into_iter().collect(),
        });
    }
    Ok(name)
}
