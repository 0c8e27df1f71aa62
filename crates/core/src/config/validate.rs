use super::{types::Config, ConfigError};
use crate::sizing::MachineCatalog;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Batch project and image are set
/// - Machine types resolve against the allow-list
/// - Sizing coefficients are positive
/// - Scheduling intervals are non-zero
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if config.batch.project_id.trim().is_empty() {
        return Err(invalid("batch.project_id cannot be empty"));
    }
    if config.batch.image.trim().is_empty() {
        return Err(invalid("batch.image cannot be empty"));
    }
    if config.batch.retry.max_attempts == 0 {
        return Err(invalid("batch.retry.max_attempts must be at least 1"));
    }
    if config.batch.retry.backoff_multiplier < 1.0 {
        return Err(invalid("batch.retry.backoff_multiplier must be >= 1.0"));
    }

    let catalog = MachineCatalog::up_to(&config.sizing.max_machine_type)
        .map_err(|e| invalid(&format!("sizing.max_machine_type: {}", e)))?;
    if !catalog.contains(&config.sizing.default_machine_type) {
        return Err(invalid(&format!(
            "sizing.default_machine_type {} is not allow-listed",
            config.sizing.default_machine_type
        )));
    }
    for (name, value) in config.sizing.coefficients() {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(&format!("sizing.{} must be positive", name)));
        }
    }

    if config.orchestrator.poll_interval_ms == 0 {
        return Err(invalid("orchestrator.poll_interval_ms cannot be 0"));
    }
    if config.orchestrator.tick_interval_ms == 0 {
        return Err(invalid("orchestrator.tick_interval_ms cannot be 0"));
    }
    if config.orchestrator.max_upload_attempts == 0 {
        return Err(invalid("orchestrator.max_upload_attempts must be at least 1"));
    }
    if config.gate.freshness_window_hours == 0 {
        return Err(invalid("gate.freshness_window_hours cannot be 0"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}
