//! Application settings loaded from `appSettings.json`.

use std::path::Path;
use std::sync::Arc;

use cartfeed_runtime::{InMemoryLeaseRepository, LeaseRepository, ProcessorOptions, StartFrom};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

const PLACEHOLDER_SECRET: &str = "Super secret key";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse settings: {0}")]
    Parse(String),

    #[error("Please specify a valid {0} in the appSettings.json")]
    Invalid(&'static str),

    #[error("lease store `{0}` is not compiled in; enable the `{1}` feature")]
    Unsupported(&'static str, &'static str),

    #[error(transparent)]
    Processor(#[from] cartfeed_runtime::FeedError),
}

/// Where leases and checkpoints are persisted.
#[derive(Debug, Default, Deserialize)]
#[serde(tag = "Kind", rename_all = "PascalCase")]
pub enum LeaseStoreSettings {
    #[default]
    Memory,
    #[serde(rename_all = "PascalCase")]
    Sqlite { path: String },
    #[serde(rename_all = "PascalCase")]
    Postgres {
        #[serde(deserialize_with = "secret_string")]
        connection_string: SecretString,
        #[serde(default = "default_schema")]
        schema: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppSettings {
    pub processor_name: String,
    /// Generated per process when absent.
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub lease_store: LeaseStoreSettings,
    /// Start instant for partitions without a checkpoint; absent means beginning of log.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_slow_request_ms")]
    pub slow_request_threshold_ms: u64,
    #[serde(default)]
    pub processor: ProcessorOptions,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_slow_request_ms() -> u64 {
    1000
}

fn secret_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

impl AppSettings {
    /// Reads and validates a settings file. `.toml` files need the `toml` feature.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let settings = if is_toml {
            Self::from_toml(&content)?
        } else {
            Self::from_json(&content)?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content).map_err(|err| SettingsError::Parse(err.to_string()))
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|err| SettingsError::Parse(err.to_string()))
    }

    #[cfg(not(feature = "toml"))]
    pub fn from_toml(_content: &str) -> Result<Self, SettingsError> {
        Err(SettingsError::Unsupported("toml settings", "toml"))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.processor_name.trim().is_empty() {
            return Err(SettingsError::Invalid("ProcessorName"));
        }
        if self
            .instance_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(SettingsError::Invalid("InstanceName"));
        }
        if self.partitions == 0 {
            return Err(SettingsError::Invalid("Partitions"));
        }
        match &self.lease_store {
            LeaseStoreSettings::Memory => {}
            LeaseStoreSettings::Sqlite { path } => {
                if path.trim().is_empty() {
                    return Err(SettingsError::Invalid("LeaseStore.Path"));
                }
            }
            LeaseStoreSettings::Postgres {
                connection_string,
                schema,
            } => {
                let url = connection_string.expose_secret();
                if url.trim().is_empty() || url == PLACEHOLDER_SECRET {
                    return Err(SettingsError::Invalid("LeaseStore.ConnectionString"));
                }
                if schema.trim().is_empty() {
                    return Err(SettingsError::Invalid("LeaseStore.Schema"));
                }
            }
        }
        self.processor.validate()?;
        Ok(())
    }

    pub fn start_from(&self) -> StartFrom {
        match self.start_time {
            None => StartFrom::Beginning,
            Some(at) if at == DateTime::<Utc>::MIN_UTC => StartFrom::Beginning,
            Some(at) => StartFrom::Time(at),
        }
    }

    pub fn slow_request_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slow_request_threshold_ms)
    }

    /// Opens the configured lease store.
    pub fn open_lease_store(&self) -> Result<Arc<dyn LeaseRepository>, SettingsError> {
        match &self.lease_store {
            LeaseStoreSettings::Memory => Ok(Arc::new(InMemoryLeaseRepository::new())),
            #[cfg(feature = "sqlite-persistence")]
            LeaseStoreSettings::Sqlite { path } => {
                let repository = cartfeed_runtime::SqliteLeaseRepository::new(path)?;
                Ok(Arc::new(repository))
            }
            #[cfg(not(feature = "sqlite-persistence"))]
            LeaseStoreSettings::Sqlite { .. } => {
                Err(SettingsError::Unsupported("sqlite", "sqlite-persistence"))
            }
            #[cfg(feature = "lease-postgres")]
            LeaseStoreSettings::Postgres {
                connection_string,
                schema,
            } => {
                let repository = cartfeed_runtime::PostgresLeaseRepository::new(
                    connection_string.expose_secret(),
                )
                .with_schema(schema.clone());
                Ok(Arc::new(repository))
            }
            #[cfg(not(feature = "lease-postgres"))]
            LeaseStoreSettings::Postgres { .. } => {
                Err(SettingsError::Unsupported("postgres", "lease-postgres"))
            }
        }
    }
}
