//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub coordinator: CoordinatorSettings,
    #[validate]
    pub rpc: RpcSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("vfl")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The local coordinator settings.
pub struct CoordinatorSettings {
    /// The address under which the peers reach this party. It is sent as `from` in every round
    /// message.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// address = "127.0.0.1:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VFL_COORDINATOR__ADDRESS=127.0.0.1:8080
    /// ```
    #[validate(length(min = 1))]
    pub address: String,

    /// The maximal number of concurrently running training tasks. Further training tasks are
    /// rejected until a slot frees up.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// train_task_limit = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VFL_COORDINATOR__TRAIN_TASK_LIMIT=10
    /// ```
    #[validate(range(min = 1))]
    pub train_task_limit: usize,

    /// The maximal number of concurrently running prediction tasks.
    #[validate(range(min = 1))]
    pub predict_task_limit: usize,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// The settings of the round exchange with the peers.
pub struct RpcSettings {
    /// The timeout of a single round exchange, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [rpc]
    /// timeout = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VFL_RPC__TIMEOUT=3
    /// ```
    #[validate(range(min = 1))]
    pub timeout: u64,

    /// How many times a round exchange is attempted before the task fails.
    #[validate(range(min = 1))]
    pub retry_times: u32,

    /// The pause between two attempts, in seconds.
    pub retry_interval: u64,
}

impl RpcSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// VFL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.17/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
