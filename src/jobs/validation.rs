//! Job definition validation

use super::models::JobDefinition;
use thiserror::Error;

pub const SUPPORTED_FORMATS: [&str; 8] = ["ovf", "ova", "vmdk", "qcow2", "raw", "vhd", "vhdx", "vdi"];
pub const SUPPORTED_METHODS: [&str; 4] = ["ctl", "govc", "ovftool", "web"];

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target is required")]
    MissingTarget,

    #[error("output location is required")]
    MissingOutput,

    #[error("unsupported format '{0}', expected one of: {formats}", formats = SUPPORTED_FORMATS.join(", "))]
    UnsupportedFormat(String),

    #[error("unsupported export method '{0}', expected one of: {methods}", methods = SUPPORTED_METHODS.join(", "))]
    UnsupportedMethod(String),

    #[error("job id '{0}' is invalid: use at most 128 letters, digits, '-', '_' or '.'")]
    InvalidId(String),
}

/// Check a definition before it is admitted for execution.
///
/// The id is checked separately by [`validate_id`] because an invalid id
/// cannot be recorded at all.
pub fn validate_definition(def: &JobDefinition) -> Result<(), ValidationError> {
    if def.target.trim().is_empty() {
        return Err(ValidationError::MissingTarget);
    }

    if def.output.trim().is_empty() {
        return Err(ValidationError::MissingOutput);
    }

    if let Some(format) = &def.format {
        let normalized = format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&normalized.as_str()) {
            return Err(ValidationError::UnsupportedFormat(format.clone()));
        }
    }

    if let Some(method) = &def.method {
        let normalized = method.to_ascii_lowercase();
        if !SUPPORTED_METHODS.contains(&normalized.as_str()) {
            return Err(ValidationError::UnsupportedMethod(method.clone()));
        }
    }

    Ok(())
}

pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_definition_is_valid() {
        let def = JobDefinition::new("vm-1", "/exports");
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_missing_target() {
        let def = JobDefinition::new("  ", "/exports");
        assert_eq!(validate_definition(&def), Err(ValidationError::MissingTarget));
    }

    #[test]
    fn test_missing_output() {
        let def = JobDefinition::new("vm-1", "");
        assert_eq!(validate_definition(&def), Err(ValidationError::MissingOutput));
    }

    #[test]
    fn test_format_is_case_insensitive() {
        let def = JobDefinition::new("vm-1", "/exports").with_format("QCOW2");
        assert!(validate_definition(&def).is_ok());

        let def = JobDefinition::new("vm-1", "/exports").with_format("iso");
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::UnsupportedFormat(f)) if f == "iso"
        ));
    }

    #[test]
    fn test_unknown_method() {
        let def = JobDefinition::new("vm-1", "/exports").with_method("scp");
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("govc"));
    }

    #[test]
    fn test_id_charset() {
        assert!(validate_id("nightly-backup.2024_01").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"x".repeat(129)).is_err());
    }
}
