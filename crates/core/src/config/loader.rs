//! Config loading: a TOML file overlaid with `CELLINGEST_*` environment
//! variables. Nested keys are separated by `__`, e.g.
//! `CELLINGEST_BATCH__API_TOKEN`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

use super::{types::Config, ConfigError};

/// Environment variable naming the config file.
const CONFIG_PATH_VAR: &str = "CELLINGEST_CONFIG";

const ENV_PREFIX: &str = "CELLINGEST_";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Path of the config file: `$CELLINGEST_CONFIG`, else `config.toml`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load `path`, then apply environment overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    extract(Figment::from(Toml::file(path)).merge(env_overrides()))
}

/// Load from a TOML string without environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    extract(Figment::from(Toml::string(toml_str)))
}

fn env_overrides() -> Env {
    // the path variable shares the prefix but is not a config key
    Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__")
}

fn extract(figment: Figment) -> Result<Config, ConfigError> {
    figment
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}
