//! Configuration loading helpers
//!
//! Layering (lowest to highest): serde defaults, config file, environment.

use std::path::Path;

use errors::{IgnisError, IgnisResult};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use tracing::{info, warn};

/// Build the figment for a config file plus prefixed environment overrides
///
/// A missing file is not an error; defaults and environment still apply.
/// Nested keys use `__` in variable names, e.g. `IGNIS_DATABASE__URL`.
pub fn figment_for(path: impl AsRef<Path>, env_prefix: &str) -> IgnisResult<Figment> {
    let path = path.as_ref();
    let mut figment = Figment::new();

    if path.exists() {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| IgnisError::config("Config file must have an extension"))?;

        figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(IgnisError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };
        info!("Config file: {}", path.display());
    } else {
        warn!("Config file not found: {}, using defaults", path.display());
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load a configuration value from file + environment
pub fn load_config<T>(path: impl AsRef<Path>, env_prefix: &str) -> IgnisResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    figment_for(path, env_prefix)?
        .extract()
        .map_err(|e| IgnisError::config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default = "default_name")]
        name: String,
        #[serde(default)]
        port: u16,
    }

    fn default_name() -> String {
        "alarmsrv".to_string()
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let sample: Sample = load_config("/nonexistent/alarmsrv.yaml", "IGNIS_TEST_A_").unwrap();
        assert_eq!(sample.name, "alarmsrv");
        assert_eq!(sample.port, 0);
    }

    #[test]
    fn test_yaml_file_is_merged() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: site-gateway\nport: 502").unwrap();

        let sample: Sample = load_config(file.path(), "IGNIS_TEST_B_").unwrap();
        assert_eq!(sample.name, "site-gateway");
        assert_eq!(sample.port, 502);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result: IgnisResult<Sample> = load_config(file.path(), "IGNIS_TEST_C_");
        assert!(result.is_err());
    }
}
