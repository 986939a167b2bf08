//! Configuration validation.

use super::Config;
use crate::error::{LoadError, Result};
use std::collections::HashSet;

const SSL_MODES: &[&str] = &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.snapshot_root.as_os_str().is_empty() {
        return Err(LoadError::Config("source.snapshot_root is required".into()));
    }
    if config.source.kinds.is_empty() {
        return Err(LoadError::Config(
            "source.kinds must list at least one entity kind".into(),
        ));
    }
    let mut seen = HashSet::new();
    for kind in &config.source.kinds {
        if !seen.insert(kind) {
            return Err(LoadError::Config(format!(
                "source.kinds lists '{}' more than once",
                kind
            )));
        }
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(LoadError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(LoadError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(LoadError::Config("target.user is required".into()));
    }
    if !is_plain_identifier(&config.target.schema) {
        return Err(LoadError::Config(format!(
            "target.schema '{}' must be a plain identifier (letters, digits, underscore)",
            config.target.schema
        )));
    }
    if !SSL_MODES.contains(&config.target.ssl_mode.to_lowercase().as_str()) {
        return Err(LoadError::Config(format!(
            "target.ssl_mode must be one of {}, got '{}'",
            SSL_MODES.join(", "),
            config.target.ssl_mode
        )));
    }

    // Load config validation - only check if explicitly set
    if let Some(0) = config.load.workers {
        return Err(LoadError::Config("load.workers must be at least 1".into()));
    }
    if let Some(0) = config.load.batch_rows {
        return Err(LoadError::Config("load.batch_rows must be at least 1".into()));
    }
    if let Some(0) = config.load.writers_per_table {
        return Err(LoadError::Config(
            "load.writers_per_table must be at least 1".into(),
        ));
    }
    if let Some(0) = config.load.channel_depth {
        return Err(LoadError::Config("load.channel_depth must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&config.load.max_error_rate) {
        return Err(LoadError::Config(
            "load.max_error_rate must be between 0 and 1".into(),
        ));
    }
    if config.load.flush_timeout_secs == 0 {
        return Err(LoadError::Config(
            "load.flush_timeout_secs must be at least 1".into(),
        ));
    }

    // Constraint config validation
    if config.constraints.validation_workers == 0 {
        return Err(LoadError::Config(
            "constraints.validation_workers must be at least 1".into(),
        ));
    }
    if config.constraints.statement_timeout_secs == 0 {
        return Err(LoadError::Config(
            "constraints.statement_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
