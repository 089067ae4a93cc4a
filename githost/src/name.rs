//! Validation of untrusted path segments (repository and user names).

/// Error type for name validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("empty name")]
    Empty,
    #[error("invalid name: {0}")]
    Invalid(String),
}

/// Validate a single path segment against `[A-Za-z0-9_.-]+`.
///
/// Traversal sequences (`..`) and path separators are rejected even though
/// dots are otherwise allowed.
pub fn sanitize_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(NameError::Invalid(name.to_string()));
    }

    let allowed = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !allowed {
        return Err(NameError::Invalid(name.to_string()));
    }

    Ok(name)
}
