// ABOUTME: Replication profile configuration loaded from a TOML file
// ABOUTME: Resolves one named profile into validated table, connection and offset settings

use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};

/// Contents of a replicator configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    /// Directory holding one status record per profile
    #[serde(default)]
    pub status_dir: Option<PathBuf>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

/// One table replicated from a source to a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    pub table: String,
    pub primary_key: String,
    pub incremental_field: String,
    /// Always perform a full copy
    #[serde(default, deserialize_with = "flag")]
    pub retroactive: bool,
    /// Columns to replicate; all columns when absent or `["*"]`
    #[serde(default)]
    pub selected_fields: Option<Vec<String>>,
    #[serde(default)]
    pub offset: Offset,
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Lookback subtracted from the last successful timestamp when selecting
/// updated rows, to tolerate clock skew between the databases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Offset {
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
}

impl Offset {
    pub fn new(hours: u32, minutes: u32) -> Self {
        Self { hours, minutes }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::hours(i64::from(self.hours)) + Duration::minutes(i64::from(self.minutes))
    }
}

/// Connection to one database.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub connection: String,
    #[serde(default)]
    pub ssl: SslConfig,
}

/// TLS material for a connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfig {
    #[serde(default, deserialize_with = "flag")]
    pub required: bool,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl ReplicatorConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))
            .map_err(|e| SyncError::configuration(format!("{:#}", e)))?;
        Self::parse(&contents).map_err(|e| match e {
            SyncError::Configuration(msg) => {
                SyncError::configuration(format!("{:?}: {}", path, msg))
            }
            other => other,
        })
    }

    pub fn parse(contents: &str) -> SyncResult<Self> {
        toml::from_str(contents)
            .map_err(|e| SyncError::configuration(format!("invalid configuration: {}", e)))
    }

    /// Look up and validate one profile.
    pub fn profile(&self, name: &str) -> SyncResult<&ProfileConfig> {
        let profile = self.profiles.get(name).ok_or_else(|| {
            SyncError::configuration(format!("profile '{}' is not defined", name))
        })?;
        profile.validate().map_err(|e| match e {
            SyncError::Configuration(msg) => {
                SyncError::configuration(format!("profile '{}': {}", name, msg))
            }
            other => other,
        })?;
        Ok(profile)
    }
}

impl ProfileConfig {
    pub fn validate(&self) -> SyncResult<()> {
        for (field, value) in [
            ("table", &self.table),
            ("primary_key", &self.primary_key),
            ("incremental_field", &self.incremental_field),
            ("source.connection", &self.source.connection),
            ("destination.connection", &self.destination.connection),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::configuration(format!("'{}' is empty", field)));
            }
        }

        if let Some(fields) = &self.selected_fields {
            let restrictive = !(fields.is_empty() || (fields.len() == 1 && fields[0] == "*"));
            if restrictive {
                for required in [&self.primary_key, &self.incremental_field] {
                    if !fields.contains(required) {
                        return Err(SyncError::configuration(format!(
                            "selected_fields must include '{}'",
                            required
                        )));
                    }
                }
            }
        }

        self.source.ssl.validate("source")?;
        self.destination.ssl.validate("destination")?;
        Ok(())
    }

    pub fn selected_fields(&self) -> Option<&[String]> {
        self.selected_fields.as_deref()
    }
}

impl SslConfig {
    fn validate(&self, side: &str) -> SyncResult<()> {
        if !self.required {
            return Ok(());
        }
        if self.ca.is_none() {
            return Err(SyncError::configuration(format!(
                "{}.ssl.required is set but no CA certificate is configured",
                side
            )));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(SyncError::configuration(format!(
                "{}.ssl needs both cert and key for a client certificate",
                side
            )));
        }
        Ok(())
    }
}

/// Default status directory: `~/.table-replicator`.
pub fn default_status_dir() -> SyncResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::configuration("could not determine home directory"))?;
    Ok(home.join(".table-replicator"))
}

/// Accepts `true`/`false` as well as the `0`/`1` integers older profiles use.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(serde::de::Error::custom(format!(
            "expected 0 or 1, got {}",
            other
        ))),
    }
}
