use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("runner.subscription_name must not be empty")]
    MissingSubscriptionName,

    #[error("storage.output_bucket must not be empty")]
    MissingOutputBucket,

    #[error("runner.threads must be at least 1")]
    NoThreads,

    #[error("runner.suspend_window must be positive")]
    ZeroSuspendWindow,

    #[error("runner.max_redeliveries must be at least 1")]
    NoRedeliveries,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_runner(config)?;
    validate_storage(config)?;
    Ok(())
}

fn validate_runner(config: &Config) -> Result<(), ValidationError> {
    let runner = &config.runner;

    if runner.subscription_name.trim().is_empty() {
        return Err(ValidationError::MissingSubscriptionName);
    }

    if runner.threads == 0 {
        return Err(ValidationError::NoThreads);
    }

    if runner.suspend_window.as_duration().is_zero() {
        return Err(ValidationError::ZeroSuspendWindow);
    }

    if runner.max_redeliveries == 0 {
        return Err(ValidationError::NoRedeliveries);
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.output_bucket.trim().is_empty() {
        return Err(ValidationError::MissingOutputBucket);
    }

    Ok(())
}
