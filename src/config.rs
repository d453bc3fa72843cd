use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Bearer token callers must present. Falls back to `auth_token_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Comma-separated session credentials. Falls back to `credentials_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default = "default_credentials_env")]
    pub credentials_env: String,
    /// Caller-facing model id -> upstream model id.
    #[serde(default = "default_model_mapping")]
    pub models: HashMap<String, String>,
    /// Caller-facing model ids exempt from per-account limit tracking.
    #[serde(default = "default_unlimited_models")]
    pub unlimited_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream: UpstreamConfig::default(),
            auth_token: None,
            auth_token_env: default_auth_token_env(),
            credentials: None,
            credentials_env: default_credentials_env(),
            models: default_model_mapping(),
            unlimited_models: default_unlimited_models(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "https://mammouth.ai".to_string()
}

fn default_auth_token_env() -> String {
    "AUTH_TOKEN".to_string()
}

fn default_credentials_env() -> String {
    "COOKIES".to_string()
}

fn default_model_mapping() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(
        "claude-3-7-sonnet-latest".to_string(),
        "anthropic-claude-3-7-sonnet-latest".to_string(),
    );
    map.insert("grok-3".to_string(), "xai-grok-3-beta".to_string());
    map.insert(
        "gemini-2.5-pro-preview-05-06".to_string(),
        "google-gemini-2.5-pro".to_string(),
    );
    map.insert("gpt-4o-mini".to_string(), "openai-gpt-4o-mini".to_string());
    map
}

fn default_unlimited_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string()]
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to built-in
    /// defaults when none exists.
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

        Ok(Self::default())
    }

    /// Resolve the static bearer token callers must present.
    pub fn resolve_auth_token(&self) -> String {
        if let Some(ref token) = self.auth_token {
            return token.clone();
        }
        std::env::var(&self.auth_token_env).unwrap_or_else(|_| "sk-123456".to_string())
    }

    /// Resolve the raw credential list (inline value or environment variable).
    pub fn resolve_credentials(&self) -> String {
        if let Some(ref creds) = self.credentials {
            return creds.clone();
        }
        std::env::var(&self.credentials_env).unwrap_or_default()
    }

    pub fn is_unlimited_model(&self, model: &str) -> bool {
        self.unlimited_models.iter().any(|m| m == model)
    }

    pub fn chat_url(&self) -> String {
        format!(
            "{}/api/models/llms",
            self.upstream.base_url.trim_end_matches('/')
        )
    }

    pub fn upload_url(&self) -> String {
        format!(
            "{}/api/attachments/saveFile",
            self.upstream.base_url.trim_end_matches('/')
        )
    }

    pub fn origin(&self) -> String {
        self.upstream.base_url.trim_end_matches('/').to_string()
    }

    pub fn referer(&self) -> String {
        format!("{}/app/a/default", self.upstream.base_url.trim_end_matches('/'))
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("mammouth-proxy.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = home_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("mammouth-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(
                PathBuf::from(xdg)
                    .join("mammouth-proxy")
                    .join("config.toml"),
            );
        }
        if let Some(home) = home_path() {
            paths.push(
                home.join(".config")
                    .join("mammouth-proxy")
                    .join("config.toml"),
            );
        }
    }

    // Home directory fallback
    if let Some(home) = home_path() {
        paths.push(home.join(".mammouth-proxy.toml"));
    }

    paths
}

fn home_path() -> Option<PathBuf> {
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
auth_token = "sk-test"
credentials = "c1, c2"
unlimited_models = []

[upstream]
base_url = "http://127.0.0.1:9999"

[models]
"my-model" = "upstream-my-model"
"#
        )
        .unwrap();

        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.resolve_auth_token(), "sk-test");
        assert_eq!(config.resolve_credentials(), "c1, c2");
        assert_eq!(
            config.models.get("my-model"),
            Some(&"upstream-my-model".to_string())
        );
        assert_eq!(config.chat_url(), "http://127.0.0.1:9999/api/models/llms");
        assert_eq!(
            config.upload_url(),
            "http://127.0.0.1:9999/api/attachments/saveFile"
        );
    }

    #[test]
    fn test_default_model_table() {
        let config = ProxyConfig::default();
        assert_eq!(
            config.models.get("gpt-4o-mini"),
            Some(&"openai-gpt-4o-mini".to_string())
        );
        assert!(config.is_unlimited_model("gpt-4o-mini"));
        assert!(!config.is_unlimited_model("grok-3"));
    }
}
