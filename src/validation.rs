/**
 * Input Validation Module
 *
 * Centralized validation for configuration values, identity labels,
 * and archive identifiers. Labels end up as file names under the
 * gallery directory, so the character set is deliberately narrow.
 */
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Longest label or archive identifier accepted
pub const MAX_LABEL_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Value too long: max {max}, got {actual}")]
    ValueTooLong { max: usize, actual: usize },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal attempt detected")]
    PathTraversal,
}

/// Validate an identity label (alphanumeric + underscore/hyphen, max 64 chars)
pub fn validate_label(label: &str) -> Result<String, ValidationError> {
    validate_token("Label", label)
}

/// Validate an archive identifier (same character rules as labels)
pub fn validate_identifier(id: &str) -> Result<String, ValidationError> {
    validate_token("Identifier", id)
}

fn validate_token(what: &str, value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidFormat(format!(
            "{} cannot be empty",
            what
        )));
    }

    if value.len() > MAX_LABEL_LEN {
        return Err(ValidationError::ValueTooLong {
            max: MAX_LABEL_LEN,
            actual: value.len(),
        });
    }

    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidFormat(format!(
            "{} can only contain letters, numbers, underscores, and hyphens",
            what
        )));
    }

    Ok(value.to_string())
}

/// Validate the match threshold (Euclidean distance, finite and in (0, 4])
///
/// Unit-length descriptors are never more than 2.0 apart; 4.0 leaves room
/// for embedders that do not normalize.
pub fn validate_match_threshold(threshold: f32) -> Result<f32, ValidationError> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 4.0 {
        return Err(ValidationError::InvalidRange(format!(
            "Match threshold must be in (0.0, 4.0], got {}",
            threshold
        )));
    }
    Ok(threshold)
}

/// Validate the recognition interval in milliseconds (0ms to 60000ms)
pub fn validate_interval_ms(interval_ms: u64) -> Result<u64, ValidationError> {
    if interval_ms > 60_000 {
        return Err(ValidationError::InvalidRange(format!(
            "Recognition interval must be at most 60000ms, got {}ms",
            interval_ms
        )));
    }
    Ok(interval_ms)
}

/// Validate the enrollment recording duration in milliseconds (500ms to 15000ms)
pub fn validate_record_ms(duration_ms: u64) -> Result<u64, ValidationError> {
    if !(500..=15_000).contains(&duration_ms) {
        return Err(ValidationError::InvalidRange(format!(
            "Recording duration must be between 500ms and 15000ms, got {}ms",
            duration_ms
        )));
    }
    Ok(duration_ms)
}

/// Validate worker count (1 to 8)
pub fn validate_workers(workers: usize) -> Result<usize, ValidationError> {
    if !(1..=8).contains(&workers) {
        return Err(ValidationError::InvalidRange(format!(
            "Worker count must be between 1 and 8, got {}",
            workers
        )));
    }
    Ok(workers)
}

/// Validate enrollment queue depth (1 to 64)
pub fn validate_queue_depth(depth: usize) -> Result<usize, ValidationError> {
    if !(1..=64).contains(&depth) {
        return Err(ValidationError::InvalidRange(format!(
            "Queue depth must be between 1 and 64, got {}",
            depth
        )));
    }
    Ok(depth)
}

/// Validate the capture sample rate against the rate the pipeline expects
pub fn validate_sample_rate(rate_hz: u32, expected_hz: u32) -> Result<u32, ValidationError> {
    if rate_hz != expected_hz {
        return Err(ValidationError::InvalidRange(format!(
            "Sample rate must be {}Hz, got {}Hz",
            expected_hz, rate_hz
        )));
    }
    Ok(rate_hz)
}

/// Validate a path stored relative to a data directory
///
/// Must be relative and made only of plain components, so joining it onto
/// the directory can never leave it.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::InvalidPath(
            "Path cannot be empty".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(ValidationError::InvalidPath(
            "Path contains null byte".to_string(),
        ));
    }

    let path_buf = PathBuf::from(path);
    if path_buf.is_absolute() || path_buf.has_root() {
        return Err(ValidationError::InvalidPath(
            "Absolute paths not allowed".to_string(),
        ));
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => return Err(ValidationError::PathTraversal),
            _ => {
                return Err(ValidationError::InvalidPath(format!(
                    "Unexpected component in '{}'",
                    path
                )))
            }
        }
    }

    Ok(path_buf)
}

/// Validate device name (max 256 chars, no control characters)
pub fn validate_device_name(name: &str) -> Result<String, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "Device name cannot be empty".to_string(),
        ));
    }

    if name.len() > 256 {
        return Err(ValidationError::ValueTooLong {
            max: 256,
            actual: name.len(),
        });
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidFormat(
            "Device name contains invalid control characters".to_string(),
        ));
    }

    Ok(name.to_string())
}

/// Validate optional device name
pub fn validate_opt_device_name(name: &Option<String>) -> Result<(), ValidationError> {
    if let Some(n) = name {
        validate_device_name(n)?;
    }
    Ok(())
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn label_accepts_allowed_set(s in r"[A-Za-z0-9_\-]{1,64}") {
            assert!(validate_label(&s).is_ok());
        }

        #[test]
        fn label_rejects_separators(s in r"[A-Za-z0-9]{0,8}[/\\. ][A-Za-z0-9]{0,8}") {
            assert!(validate_label(&s).is_err());
        }

        #[test]
        fn threshold_in_range(x in 0.001f32..4.0) {
            assert!(validate_match_threshold(x).is_ok());
        }

        #[test]
        fn interval_outside_range(x in 60_001u64..u64::MAX) {
            assert!(validate_interval_ms(x).is_err());
        }
    }
}
