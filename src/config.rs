use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "ai-gateway";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Environment variable holding an upstream key for clients that send none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_fetch_pricing")]
    pub fetch_pricing: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_target_url() -> String {
    "https://router.requesty.ai/v1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ai-gateway.db")
}

fn default_fetch_pricing() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            target_url: default_target_url(),
            db_path: default_db_path(),
            api_key_env: None,
            fetch_pricing: default_fetch_pricing(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.target_url = config.target_url.trim_end_matches('/').to_string();
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Set the upstream base URL, dropping any trailing `/`.
    pub fn set_target_url(&mut self, url: &str) {
        self.target_url = url.trim_end_matches('/').to_string();
    }

    /// The fallback upstream key, if one is configured and present in the environment.
    pub fn fallback_api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                tracing::warn!(var, "Fallback API key variable is not set");
                None
            }
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("{APP_NAME}.toml"))];

    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join(APP_NAME)
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join(APP_NAME).join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join(APP_NAME).join("config.toml"));
        }
    }

    if let Some(home) = home_dir() {
        paths.push(home.join(format!(".{APP_NAME}.toml")));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000
target_url = "http://localhost:9000/v1/"
db_path = "/tmp/gw.db"
api_key_env = "GATEWAY_TEST_KEY"
fetch_pricing = false
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.target_url, "http://localhost:9000/v1");
        assert_eq!(config.db_path, PathBuf::from("/tmp/gw.db"));
        assert_eq!(config.api_key_env.as_deref(), Some("GATEWAY_TEST_KEY"));
        assert!(!config.fetch_pricing);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "port = 9999").unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(
            config,
            GatewayConfig {
                port: 9999,
                ..GatewayConfig::default()
            }
        );
        assert_eq!(config.target_url, "https://router.requesty.ai/v1");
        assert!(config.fetch_pricing);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = GatewayConfig::find_and_load(Some(Path::new("/nonexistent/gw.toml")))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }

    #[test]
    fn test_fallback_key_requires_variable() {
        let config = GatewayConfig {
            api_key_env: Some("AI_GATEWAY_TEST_UNSET_VARIABLE".to_string()),
            ..GatewayConfig::default()
        };
        assert_eq!(config.fallback_api_key(), None);
        assert_eq!(GatewayConfig::default().fallback_api_key(), None);
    }

    #[test]
    fn test_search_paths_start_in_cwd() {
        let paths = config_search_paths();
        assert_eq!(paths[0], PathBuf::from("ai-gateway.toml"));
    }
}
