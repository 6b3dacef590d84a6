//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity > 0, intervals > 0)
//! - Validate addresses the process will bind
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::Config;

/// A single semantic violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let pool = &config.pool;

    if pool.host.trim().is_empty() {
        errors.push(ValidationError::new("pool.host", "must not be empty"));
    }
    if pool.capacity == 0 {
        errors.push(ValidationError::new("pool.capacity", "must be at least 1"));
    }
    if pool.reconnect_interval_ms == 0 {
        errors.push(ValidationError::new("pool.reconnect_interval_ms", "must be greater than 0"));
    }
    if pool.probe_timeout_ms == 0 {
        errors.push(ValidationError::new("pool.probe_timeout_ms", "must be greater than 0"));
    }
    if pool.checkout_timeout_ms == Some(0) {
        errors.push(ValidationError::new("pool.checkout_timeout_ms", "must be greater than 0 when set"));
    }

    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }
    if obs.log_level.trim().is_empty() {
        errors.push(ValidationError::new("observability.log_level", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
