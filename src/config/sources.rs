use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "PIPELINE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
const ENV_PREFIX: &str = "PIPELINE";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    load_with_path(None)
}

/// Same as [`load`], with an explicit file taking precedence over
/// `PIPELINE_CONFIG`
pub fn load_with_path(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = path.unwrap_or_else(|| {
        env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    });

    let mut config = load_from_sources(config_path)?;

    load_secrets(&mut config);

    Ok(config)
}

/// Load secrets into config.
/// Secrets are never stored in TOML files, only in environment
fn load_secrets(config: &mut Config) {
    // AWS_ACCESS_KEY is what most pipeline deployments set; fall back to the
    // standard AWS name.
    config.storage.access_key = env::var("AWS_ACCESS_KEY")
        .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
        .ok();
    config.storage.secret_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // PIPELINE__RUNNER__SUBSCRIPTION_NAME -> runner.subscription_name
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .list_separator(",")
            .with_list_parse_key("storage.input_buckets")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
