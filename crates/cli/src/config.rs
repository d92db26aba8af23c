// Connection settings for the CLI.
//
// Global config: `~/.tandem/config.toml`
// Precedence: command-line flag, then environment variable, then config file, then default.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Root directory for Tandem client state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the global config file: `~/.tandem/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CliConfig {
    /// Base URL of the Tandem server (e.g. `https://tandem.example.com`).
    pub server_url: Option<String>,
    /// Bearer token issued for one workspace.
    pub token: Option<String>,
    /// Workspace to act in when it differs from the token's own workspace.
    pub workspace_id: Option<Uuid>,
}

impl CliConfig {
    /// Load from `~/.tandem/config.toml`. Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        match global_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config `{}`", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config `{}`", path.display()))
    }
}

/// Connection flags shared by every command.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// Tandem server base URL.
    #[arg(long, env = "TANDEM_SERVER_URL", global = true)]
    pub server: Option<String>,

    /// Bearer token.
    #[arg(long, env = "TANDEM_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Workspace to act in (defaults to the token's workspace).
    #[arg(long, env = "TANDEM_WORKSPACE_ID", global = true)]
    pub workspace: Option<Uuid>,
}

/// Fully resolved connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub server_url: Url,
    pub token: String,
    pub workspace_id: Option<Uuid>,
}

impl ConnectionArgs {
    pub fn resolve(&self) -> Result<Connection> {
        self.resolve_with(CliConfig::load()?)
    }

    pub fn resolve_with(&self, file: CliConfig) -> Result<Connection> {
        let raw_url = self
            .server
            .clone()
            .or(file.server_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url =
            Url::parse(&raw_url).with_context(|| format!("invalid server url `{raw_url}`"))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(anyhow!("server url `{raw_url}` must use http or https"));
        }

        let token = self
            .token
            .clone()
            .or(file.token)
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("no auth token configured; pass --token or set TANDEM_TOKEN")
            })?;

        Ok(Connection { server_url, token, workspace_id: self.workspace.or(file.workspace_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).expect("config should be written");
        path
    }

    #[test]
    fn loads_config_file() {
        let dir = TempDir::new().expect("tempdir should be created");
        let workspace_id = Uuid::new_v4();
        let path = write_config(
            &dir,
            &format!(
                "server_url = \"https://tandem.test\"\ntoken = \"abc\"\nworkspace_id = \"{workspace_id}\"\n"
            ),
        );

        let config = CliConfig::load_from(&path).expect("config should load");
        assert_eq!(config.server_url.as_deref(), Some("https://tandem.test"));
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.workspace_id, Some(workspace_id));
    }

    #[test]
    fn missing_keys_default_to_none() {
        let dir = TempDir::new().expect("tempdir should be created");
        let path = write_config(&dir, "token = \"abc\"\n");
        let config = CliConfig::load_from(&path).expect("config should load");
        assert_eq!(config.server_url, None);
        assert_eq!(config.workspace_id, None);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = TempDir::new().expect("tempdir should be created");
        let path = write_config(&dir, "token = [");
        assert!(CliConfig::load_from(&path).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let args = ConnectionArgs {
            server: Some("http://localhost:3000".into()),
            token: Some("flag-token".into()),
            workspace: None,
        };
        let file = CliConfig {
            server_url: Some("https://ignored.test".into()),
            token: Some("file-token".into()),
            workspace_id: Some(Uuid::new_v4()),
        };

        let connection = args.resolve_with(file.clone()).expect("connection should resolve");
        assert_eq!(connection.server_url.as_str(), "http://localhost:3000/");
        assert_eq!(connection.token, "flag-token");
        assert_eq!(connection.workspace_id, file.workspace_id);
    }

    #[test]
    fn defaults_server_url() {
        let args = ConnectionArgs { token: Some("t".into()), ..Default::default() };
        let connection =
            args.resolve_with(CliConfig::default()).expect("connection should resolve");
        assert_eq!(connection.server_url.as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = ConnectionArgs::default()
            .resolve_with(CliConfig::default())
            .expect_err("missing token should fail");
        assert!(format!("{err:#}").contains("TANDEM_TOKEN"));
    }

    #[test]
    fn rejects_non_http_server_urls() {
        let args = ConnectionArgs {
            server: Some("ftp://tandem.test".into()),
            token: Some("t".into()),
            workspace: None,
        };
        assert!(args.resolve_with(CliConfig::default()).is_err());
    }
}
