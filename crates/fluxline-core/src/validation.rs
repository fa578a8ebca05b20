//! Input validation for engine operations.
//!
//! Validates names, identifiers, tags, and schedule expressions before
//! they reach the store.

use crate::{EngineError, Result};

/// Maximum length for pipeline and dataset names
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length for project/source identifiers
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Maximum length for tag values
pub const MAX_TAG_LEN: usize = 100;

/// Maximum length for a schedule expression
pub const MAX_SCHEDULE_LEN: usize = 255;

/// Validate a pipeline or dataset name.
///
/// Requirements:
/// - Not empty
/// - <= 255 characters
/// - Alphanumeric, underscore, hyphen, dot, space
/// - Cannot start or end with hyphen
pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{} cannot be empty", what)));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation(format!(
            "{} too long: {} > {} characters",
            what,
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ' ')
    {
        return Err(EngineError::Validation(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -, ., space)",
            what
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(EngineError::Validation(format!(
            "{} cannot start or end with hyphen",
            what
        )));
    }

    Ok(())
}

/// Validate a project/source/user identifier.
pub fn validate_identifier(identifier: &str, field_name: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(EngineError::Validation(format!(
            "{} cannot be empty",
            field_name
        )));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(EngineError::Validation(format!(
            "{} too long: {} > {} characters",
            field_name,
            identifier.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if !identifier
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(EngineError::Validation(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -)",
            field_name
        )));
    }

    Ok(())
}

/// Validate a dataset tag.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(EngineError::Validation("Tag cannot be empty".to_string()));
    }

    if tag.len() > MAX_TAG_LEN {
        return Err(EngineError::Validation(format!(
            "Tag too long: {} > {} characters",
            tag.len(),
            MAX_TAG_LEN
        )));
    }

    if !tag
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':')
    {
        return Err(EngineError::Validation(
            "Tag contains invalid characters (allowed: alphanumeric, _, -, :)".to_string(),
        ));
    }

    Ok(())
}

/// Validate a cron-style schedule expression.
///
/// The engine never parses the expression itself (the scheduler's caller
/// computes `next_scheduled_run`), so validation is shape-level: non-empty,
/// bounded length, five or six whitespace-separated fields of cron
/// characters.
pub fn validate_schedule_expression(expression: &str) -> Result<()> {
    if expression.is_empty() {
        return Err(EngineError::Validation(
            "Schedule expression cannot be empty".to_string(),
        ));
    }

    if expression.len() > MAX_SCHEDULE_LEN {
        return Err(EngineError::Validation(format!(
            "Schedule expression too long: {} > {} characters",
            expression.len(),
            MAX_SCHEDULE_LEN
        )));
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(EngineError::Validation(format!(
            "Schedule expression must have 5 or 6 fields, got {}",
            fields.len()
        )));
    }

    if !expression
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || " */,-?".contains(c))
    {
        return Err(EngineError::Validation(
            "Schedule expression contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a file:// store path for traversal attacks.
pub fn validate_store_path(path: &str) -> Result<()> {
    if path.contains("..") {
        return Err(EngineError::Validation(
            "Path contains traversal pattern (..)".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(EngineError::Validation(
            "Path contains null byte".to_string(),
        ));
    }

    Ok(())
}
