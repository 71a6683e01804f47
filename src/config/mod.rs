mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File, Source};

pub use settings::{
    BrokerSettings, LoggingSettings, PartialSettings, ReconnectSettings, Settings, TlsConfig,
};

/// Prefix of the environment variables read by `load_config`, e.g.
/// `STOMPSUB__BROKER__ADDRESS`.
pub const ENV_PREFIX: &str = "STOMPSUB";

/// Loads the configuration from the optional `config/default` file and
/// environment variables, merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Like `load_config`, but the file at `path` must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
