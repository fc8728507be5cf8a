use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DispatchConfig;
use crate::github::DEFAULT_API_URL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub github_api_url: String,
    /// YAML policy rules, reloaded on SIGHUP.
    pub policy_path: PathBuf,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// Bearer token for `/status`. When unset the endpoint returns 403.
    pub status_auth_token: Option<String>,
    pub recording_enabled: bool,
    pub recording_log_path: String,
    pub dispatch: DispatchConfig,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name).with_context(|| format!("{} environment variable is required", name))
        };

        let github_app_id = required("GITHUB_APP_ID")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = required("GITHUB_PRIVATE_KEY")?.replace("\\n", "\n");

        let github_webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;

        let github_api_url = lookup("GITHUB_API_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let policy_path = lookup("POLICY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("reviewgate.yaml"));

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let status_auth_token = parse_status_auth_token(lookup("STATUS_AUTH_TOKEN"));

        let recording_enabled = lookup("RECORDING_ENABLED")
            .unwrap_or_else(|| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let recording_log_path =
            lookup("RECORDING_LOG_PATH").unwrap_or_else(|| "recordings.jsonl".to_string());

        let defaults = DispatchConfig::default();
        let max_attempts = match lookup("DISPATCH_MAX_ATTEMPTS") {
            Some(value) => value
                .parse::<u32>()
                .context("DISPATCH_MAX_ATTEMPTS must be a valid number")?,
            None => defaults.max_attempts,
        };
        if max_attempts == 0 {
            anyhow::bail!("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }
        let initial_backoff = parse_millis(
            lookup("DISPATCH_INITIAL_BACKOFF_MS"),
            "DISPATCH_INITIAL_BACKOFF_MS",
            defaults.initial_backoff,
        )?;
        let max_backoff = parse_millis(
            lookup("DISPATCH_MAX_BACKOFF_MS"),
            "DISPATCH_MAX_BACKOFF_MS",
            defaults.max_backoff,
        )?;

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            github_api_url,
            policy_path,
            port,
            state_dir,
            status_auth_token,
            recording_enabled,
            recording_log_path,
            dispatch: DispatchConfig {
                max_attempts,
                initial_backoff,
                max_backoff,
            },
            log_format,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("reviewgate.db")
    }
}

fn parse_millis(value: Option<String>, name: &str, default: Duration) -> Result<Duration> {
    match value {
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .with_context(|| format!("{} must be a valid number of milliseconds", name)),
        None => Ok(default),
    }
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so an empty token can never grant unauthenticated access.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("GITHUB_APP_ID", "12345"),
        ("GITHUB_PRIVATE_KEY", "-----BEGIN KEY-----\\nabc\\n-----END KEY-----"),
        ("GITHUB_WEBHOOK_SECRET", "shh"),
    ];

    #[test]
    fn test_defaults() {
        let config = config_from(&REQUIRED).unwrap();
        assert_eq!(config.github_app_id, 12345);
        assert_eq!(
            config.github_private_key,
            "-----BEGIN KEY-----\nabc\n-----END KEY-----"
        );
        assert_eq!(config.github_api_url, DEFAULT_API_URL);
        assert_eq!(config.policy_path, PathBuf::from("reviewgate.yaml"));
        assert_eq!(config.port, 3000);
        assert_eq!(config.state_dir, PathBuf::from("."));
        assert_eq!(config.status_auth_token, None);
        assert!(!config.recording_enabled);
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.database_path(), PathBuf::from("./reviewgate.db"));
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("GITHUB_API_URL", "http://localhost:9999"),
            ("PORT", "8080"),
            ("DISPATCH_MAX_ATTEMPTS", "3"),
            ("DISPATCH_INITIAL_BACKOFF_MS", "10"),
            ("DISPATCH_MAX_BACKOFF_MS", "100"),
            ("LOG_FORMAT", "json"),
            ("STATUS_AUTH_TOKEN", "token"),
        ]);
        let config = config_from(&vars).unwrap();
        assert_eq!(config.github_api_url, "http://localhost:9999");
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.dispatch,
            DispatchConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
            }
        );
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.status_auth_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_missing_required_variable() {
        let err = config_from(&REQUIRED[..2]).err().unwrap();
        assert!(err.to_string().contains("GITHUB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DISPATCH_MAX_ATTEMPTS", "0"));
        assert!(config_from(&vars).is_err());
    }

    #[test]
    fn test_parse_status_auth_token_none() {
        assert_eq!(parse_status_auth_token(None), None);
    }

    #[test]
    fn test_parse_status_auth_token_empty_string() {
        assert_eq!(parse_status_auth_token(Some("".to_string())), None);
    }

    #[test]
    fn test_parse_status_auth_token_whitespace_only() {
        assert_eq!(parse_status_auth_token(Some("   ".to_string())), None);
        assert_eq!(parse_status_auth_token(Some("\t\n".to_string())), None);
    }

    #[test]
    fn test_parse_status_auth_token_with_surrounding_whitespace() {
        // Not trimmed; only checked for content.
        assert_eq!(
            parse_status_auth_token(Some("  token  ".to_string())),
            Some("  token  ".to_string())
        );
    }
}
