//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use lazy_static::lazy_static;
use regex_lite::Regex;
use std::path::Path;

lazy_static! {
    // ${VAR} or ${VAR:-default}
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern");
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from YAML text
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables.
    ///
    /// `${VAR}` keeps the placeholder when the variable is unset;
    /// `${VAR:-default}` falls back to `default`.
    fn expand_env_vars(content: &str) -> String {
        let mut result = String::with_capacity(content.len());
        let mut last_match = 0;

        for cap in ENV_VAR.captures_iter(content) {
            let Some(full_match) = cap.get(0) else {
                continue;
            };
            let var_name = &cap[1];

            result.push_str(&content[last_match..full_match.start()]);

            match std::env::var(var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => match cap.get(2) {
                    Some(default) => result.push_str(default.as_str()),
                    None => result.push_str(full_match.as_str()),
                },
            }

            last_match = full_match.end();
        }

        result.push_str(&content[last_match..]);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        std::env::set_var("HAKOBU_TEST_VAR", "test_value");
        let expanded = ConfigLoader::expand_env_vars("key: ${HAKOBU_TEST_VAR}");
        assert_eq!(expanded, "key: test_value");
        std::env::remove_var("HAKOBU_TEST_VAR");
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_default_and_missing() {
        std::env::remove_var("HAKOBU_MISSING_VAR");
        let expanded =
            ConfigLoader::expand_env_vars("a: ${HAKOBU_MISSING_VAR:-fallback}\nb: ${HAKOBU_MISSING_VAR}");
        assert_eq!(expanded, "a: fallback\nb: ${HAKOBU_MISSING_VAR}");
    }

    #[test]
    #[serial]
    fn test_from_str_with_env_credentials() {
        std::env::set_var("HAKOBU_TEST_SECRET", "s3cr3t");
        let yaml = r#"
store:
  bucket: banners
  endpoint: "http://localhost:9000"
  access_key: "${HAKOBU_TEST_ACCESS:-minioadmin}"
  secret_key: "${HAKOBU_TEST_SECRET}"
pool:
  core_size: 2
  max_size: 4
upload:
  context_path: "cnblogs-banner/"
archive:
  default_encoding: gbk
"#;
        let config = ConfigLoader::from_str(yaml).unwrap();
        std::env::remove_var("HAKOBU_TEST_SECRET");

        assert_eq!(config.store.bucket, "banners");
        assert_eq!(config.store.region, "us-east-1");
        assert_eq!(config.store.access_key.as_deref(), Some("minioadmin"));
        assert_eq!(config.store.secret_key.as_deref(), Some("s3cr3t"));
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.backlog_capacity(), 8);
        assert_eq!(config.upload.context_path, "cnblogs-banner/");
        assert_eq!(config.upload.part_size, 1024 * 1024);
        assert_eq!(config.archive.default_encoding, "gbk");
    }

    #[test]
    fn test_from_str_rejects_invalid_pool() {
        let yaml = r#"
store:
  bucket: banners
pool:
  core_size: 0
"#;
        assert!(matches!(
            ConfigLoader::from_str(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
