use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File, Map};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keystore: KeyStoreConfig,
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub timestamp: TimestampConfig,
}

/// Either value may instead come from the command line
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyStoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationConfig {
    /// Upper bound for a single OCSP or CRL fetch
    pub timeout_secs: u64,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub ocsp_url: Option<String>,
    #[serde(default)]
    pub crl_location: Option<String>,
}

impl RevocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimestampConfig {
    #[serde(default)]
    pub url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("revocation.timeout_secs", 30)?
            .add_source(File::with_name("config/settings").required(false));

        // Explicit overrides replace the process environment so tests stay isolated
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            builder = builder.add_source(environment(None));
        }

        builder.build()?.try_deserialize()
    }
}

/// `KZ_` variables, e.g. KZ_REVOCATION__TIMEOUT_SECS or KZ_KEYSTORE__PATH.
/// Reads `vars` instead of the process environment when given.
fn environment(vars: Option<Map<String, String>>) -> Environment {
    Environment::with_prefix("KZ")
        .prefix_separator("_")
        .separator("__")
        .source(vars)
}
