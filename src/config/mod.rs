mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{AuthSettings, BackpressureMode, BrokerSettings, ServerSettings, Settings};

/// Prefix of environment variables that override file settings,
/// e.g. `STOMPCOOLER__SERVER__PORT=61614`.
pub const ENV_PREFIX: &str = "STOMPCOOLER";

/// Default configuration file, resolved relative to the working directory.
/// The extension is optional.
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration from `path` (optional) and environment variables,
/// merged over `Settings::default()`.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
