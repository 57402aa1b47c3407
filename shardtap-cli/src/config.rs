use serde::{Deserialize, Serialize};
use shardtap_core::{Result, StoreConfig, TableConfig, TapError};

const ENV_PREFIX: &str = "SHARDTAP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub table: TableConfig,
    /// Overrides `store.access_key_id`, typically from `SHARDTAP_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Overrides `store.secret_access_key`, typically from `SHARDTAP_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(path, ::config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Layers `environment` over the file at `path`.
    fn load(path: &str, environment: ::config::Environment) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(environment)
            .build()
            .map_err(|e| TapError::Config(e.to_string()))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| TapError::Config(e.to_string()))?;

        config.apply_credential_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_credential_overrides(&mut self) {
        if let Some(access_key_id) = self.access_key_id.take().filter(|value| !value.is_empty()) {
            self.store.access_key_id = access_key_id;
        }
        if let Some(secret) = self.secret_access_key.take().filter(|value| !value.is_empty()) {
            self.store.secret_access_key = secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.table.validate()
    }
}
