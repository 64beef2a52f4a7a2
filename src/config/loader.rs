//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use std::path::Path;

/// Loads the proxy configuration from disk.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Read, expand and validate a proxy config file.
    ///
    /// Expansion runs on the raw text before YAML parsing, so secrets like
    /// the permission-service token can live in the environment rather
    /// than in the file. Validation rejects the config before any
    /// component is constructed from it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&Self::expand_env_vars(&raw))?;
        config.validate().map(|()| config)
    }

    /// Expand `${VAR_NAME}` and `${VAR_NAME:-default}` references against
    /// the environment. Unset variables without a default are left alone so
    /// the parse error points at the real problem.
    fn expand_env_vars(content: &str) -> String {
        let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let replacement = match std::env::var(&cap[1]) {
                Ok(value) => value,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => continue,
                },
            };
            result = result.replace(&cap[0], &replacement);
        }

        result
    }
}
