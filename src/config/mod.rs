mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BusSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the bus configuration
pub fn load_config() -> Result<Settings, ConfigError> {
    // Pick up a local .env file when present; ignore a missing one
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("__").try_parsing(true));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let bus = partial.bus.as_ref();
    Ok(Settings {
        bus: BusSettings {
            max_retained: bus
                .and_then(|b| b.max_retained)
                .unwrap_or(default.bus.max_retained),
            max_message_size_bytes: bus
                .and_then(|b| b.max_message_size_bytes)
                .unwrap_or(default.bus.max_message_size_bytes),
            max_payload_size_bytes: bus
                .and_then(|b| b.max_payload_size_bytes)
                .unwrap_or(default.bus.max_payload_size_bytes),
            rate_limit_per_second: bus
                .and_then(|b| b.rate_limit_per_second)
                .unwrap_or(default.bus.rate_limit_per_second),
            allow_global_wildcard: bus
                .and_then(|b| b.allow_global_wildcard)
                .unwrap_or(default.bus.allow_global_wildcard),
            cleanup_interval_ms: bus
                .and_then(|b| b.cleanup_interval_ms)
                .unwrap_or(default.bus.cleanup_interval_ms),
            routing_enabled: bus
                .and_then(|b| b.routing_enabled)
                .unwrap_or(default.bus.routing_enabled),
        },
    })
}

#[cfg(test)]
mod tests;
