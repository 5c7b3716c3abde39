use super::models::{Config, WebhookEndpoint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("Executor program must not be empty when set")]
    EmptyExecutorProgram,

    #[error("Webhook endpoint '{url}' must use http or https")]
    InvalidWebhookScheme { url: String },

    #[error("Webhook endpoint '{url}' subscribes to no events")]
    NoWebhookEvents { url: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_manager(config)?;
    validate_executor(config)?;
    validate_scheduler(config)?;
    validate_hub(config)?;
    validate_webhooks(config)?;
    validate_batch(config)?;
    Ok(())
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroValue { field });
    }
    Ok(())
}

fn validate_manager(config: &Config) -> Result<(), ValidationError> {
    require_positive(
        "manager.max_concurrent_jobs",
        config.manager.max_concurrent_jobs as u64,
    )
}

fn validate_executor(config: &Config) -> Result<(), ValidationError> {
    match config.executor.program.as_deref() {
        Some(program) if program.trim().is_empty() => Err(ValidationError::EmptyExecutorProgram),
        _ => Ok(()),
    }
}

fn validate_scheduler(config: &Config) -> Result<(), ValidationError> {
    require_positive("scheduler.tick_interval_ms", config.scheduler.tick_interval_ms)
}

fn validate_hub(config: &Config) -> Result<(), ValidationError> {
    require_positive("hub.mailbox_capacity", config.hub.mailbox_capacity as u64)?;
    if let Some(drops) = config.hub.disconnect_after_drops {
        require_positive("hub.disconnect_after_drops", u64::from(drops))?;
    }
    Ok(())
}

/// Scheme and event checks only; address resolution happens at registration
fn validate_webhooks(config: &Config) -> Result<(), ValidationError> {
    let webhooks = &config.webhooks;
    require_positive("webhooks.timeout_secs", webhooks.timeout_secs)?;
    require_positive(
        "webhooks.max_concurrent_deliveries",
        webhooks.max_concurrent_deliveries as u64,
    )?;
    require_positive("webhooks.queue_capacity", webhooks.queue_capacity as u64)?;

    for endpoint in &webhooks.endpoints {
        validate_endpoint(endpoint)?;
    }
    Ok(())
}

fn validate_endpoint(endpoint: &WebhookEndpoint) -> Result<(), ValidationError> {
    let lower = endpoint.url.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(ValidationError::InvalidWebhookScheme {
            url: endpoint.url.clone(),
        });
    }
    if endpoint.events.is_empty() {
        return Err(ValidationError::NoWebhookEvents {
            url: endpoint.url.clone(),
        });
    }
    Ok(())
}

fn validate_batch(config: &Config) -> Result<(), ValidationError> {
    require_positive("batch.max_concurrency", config.batch.max_concurrency as u64)
}
