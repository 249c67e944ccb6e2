use crate::{CoordinatorError, CoordinatorResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> CoordinatorResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> CoordinatorResult<()> {
        if value.trim().is_empty() {
            return Err(CoordinatorError::Configuration(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a numeric setting is strictly positive
    pub fn validate_positive(value: u64, field_name: &str) -> CoordinatorResult<()> {
        if value == 0 {
            return Err(CoordinatorError::Configuration(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// Validate that `shorter` is strictly less than `longer`
    pub fn validate_ordered(
        shorter: u64,
        shorter_name: &str,
        longer: u64,
        longer_name: &str,
    ) -> CoordinatorResult<()> {
        if shorter >= longer {
            return Err(CoordinatorError::Configuration(format!(
                "{shorter_name} ({shorter}) must be less than {longer_name} ({longer})"
            )));
        }
        Ok(())
    }

    /// Validate that a value is one of the allowed options
    pub fn validate_one_of(value: &str, allowed: &[&str], field_name: &str) -> CoordinatorResult<()> {
        if !allowed.contains(&value) {
            return Err(CoordinatorError::Configuration(format!(
                "Invalid {field_name}: {value}. Valid options: {allowed:?}"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has a valid format
    pub fn validate_url(url: &str, field_name: &str) -> CoordinatorResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(CoordinatorError::Configuration(format!(
                "{field_name} must be an http(s) URL"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_utils() {
        assert!(ValidationUtils::validate_not_empty("x", "f").is_ok());
        assert!(ValidationUtils::validate_not_empty("  ", "f").is_err());
        assert!(ValidationUtils::validate_positive(0, "f").is_err());
        assert!(ValidationUtils::validate_ordered(120, "a", 300, "b").is_ok());
        assert!(ValidationUtils::validate_ordered(300, "a", 300, "b").is_err());
        assert!(ValidationUtils::validate_one_of("log", &["log", "webhook"], "sink").is_ok());
        assert!(ValidationUtils::validate_one_of("email", &["log", "webhook"], "sink").is_err());
        assert!(ValidationUtils::validate_url("https://hooks.local/x", "url").is_ok());
        assert!(ValidationUtils::validate_url("hooks.local", "url").is_err());
    }
}
