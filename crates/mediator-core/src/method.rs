use crate::{CallError, Result};

/// Longest method identifier accepted by a registry.
pub const MAX_METHOD_LEN: usize = 64;

/// Check that a method identifier is usable as a registry key.
///
/// Identifiers are ASCII alphanumerics plus `_`, `-` and `.`, and must not
/// be empty. The worker lifecycle names `setup` and `teardown` are reserved.
pub fn validate_method_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if name.is_empty() || name.len() > MAX_METHOD_LEN || !valid_chars {
        return Err(CallError::InvalidMethodName(name.to_string()));
    }

    if matches!(name, "setup" | "teardown") {
        return Err(CallError::InvalidMethodName(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_method_name("square").is_ok());
        assert!(validate_method_name("send_post").is_ok());
        assert!(validate_method_name("thumbs.v2").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_method_name("").is_err());
        assert!(validate_method_name("has space").is_err());
        assert!(validate_method_name("setup").is_err());
        assert!(validate_method_name(&"x".repeat(MAX_METHOD_LEN + 1)).is_err());
    }
}
