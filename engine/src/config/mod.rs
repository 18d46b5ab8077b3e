//! Configuration module for Keygate
//!
//! Supports configuration via:
//! - TOML/YAML/JSON config files
//! - Environment variables (with KEYGATE_ prefix, `__` between sections)
//! - Command line arguments (CLI only)

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::GpgConfig;
use crate::git::GitConfig;
use crate::github::GitHubConfig;
use crate::trust::ForkTagPolicy;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty, json); chosen from the terminal when unset
    #[serde(default)]
    pub log_format: Option<LogFormat>,

    /// Directory for scratch checkouts; the system temp dir when unset
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// GnuPG settings
    #[serde(default)]
    pub gpg: GpgConfig,

    /// git settings
    #[serde(default)]
    pub git: GitConfig,

    /// GitHub API settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Webhook dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Webhook dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of checks waiting to run
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pull request actions that trigger a check
    #[serde(default = "default_actions")]
    pub actions: Vec<String>,

    /// Behaviour when fork tag discovery fails
    #[serde(default)]
    pub fork_tag_failures: ForkTagPolicy,

    /// Shared secret of the GitHub webhook (`X-Hub-Signature-256`)
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_actions() -> Vec<String> {
    vec![
        "opened".to_string(),
        "synchronize".to_string(),
        "reopened".to_string(),
    ]
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            actions: default_actions(),
            fork_tag_failures: ForkTagPolicy::default(),
            webhook_secret: None,
        }
    }
}

impl DispatcherConfig {
    /// Whether a pull request event with `action` should be checked
    pub fn triggers(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: None,
            work_dir: None,
            gpg: GpgConfig::default(),
            git: GitConfig::default(),
            github: GitHubConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Load from config file if present
            .add_source(config::File::with_name("config/keygate").required(false))
            .add_source(config::File::with_name("/etc/keygate/config").required(false))
            // Override with environment variables (KEYGATE_PORT, KEYGATE_GPG__KEYSERVER, ...)
            .add_source(
                config::Environment::with_prefix("KEYGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("dispatcher.actions")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.gpg.keyserver.trim().is_empty() {
            anyhow::bail!("gpg.keyserver cannot be empty");
        }

        if self.gpg.keyring.is_some() && self.gpg.allow_key_download {
            anyhow::bail!(
                "gpg.allow_key_download requires a temporary keyring; unset gpg.keyring or disable downloads"
            );
        }

        if self.github.timeout_seconds == 0 {
            anyhow::bail!("github.timeout_seconds cannot be 0");
        }

        if self.dispatcher.queue_capacity == 0 {
            anyhow::bail!("dispatcher.queue_capacity cannot be 0");
        }

        Ok(())
    }

    /// Checks that only apply to the webhook dispatcher
    pub fn validate_dispatcher(&self) -> Result<()> {
        match self.dispatcher.webhook_secret.as_deref() {
            Some(secret) if !secret.trim().is_empty() => {}
            _ => anyhow::bail!("dispatcher.webhook_secret must be set to receive webhooks"),
        }

        if self.github.token.is_some() && !self.github.api_url.starts_with("https://") {
            anyhow::bail!("github.api_url must use https when a token is configured");
        }

        Ok(())
    }

    /// Socket address the dispatcher listens on
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatcher.queue_capacity, 64);
        assert_eq!(config.dispatcher.fork_tag_failures, ForkTagPolicy::Abort);
        assert!(config.gpg.keyring.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_validation() {
        let config = AppConfig {
            port: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gpg.keyserver = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.github.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatcher.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_persistent_keyring_forbids_download() {
        let mut config = AppConfig::default();
        config.gpg.keyring = Some(PathBuf::from("/etc/keygate/trusted.kbx"));
        assert!(config.validate().is_err());

        config.gpg.allow_key_download = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatcher_requires_webhook_secret() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_dispatcher().is_err());

        config.dispatcher.webhook_secret = Some("  ".to_string());
        assert!(config.validate_dispatcher().is_err());

        config.dispatcher.webhook_secret = Some("It's a Secret to Everybody".to_string());
        assert!(config.validate_dispatcher().is_ok());

        config.github.token = Some("ghp_token".to_string());
        config.github.api_url = "http://api.github.com".to_string();
        assert!(config.validate_dispatcher().is_err());
    }

    #[test]
    fn test_triggering_actions() {
        let dispatcher = DispatcherConfig::default();
        assert!(dispatcher.triggers("opened"));
        assert!(dispatcher.triggers("synchronize"));
        assert!(!dispatcher.triggers("closed"));
        assert!(!dispatcher.triggers("labeled"));
    }

    #[test]
    fn test_sections_deserialize() {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(
                r#"
                port = 9000
                log_format = "json"

                [gpg]
                keyring = "/srv/keys.kbx"
                allow_key_download = false

                [dispatcher]
                actions = ["opened"]
                fork_tag_failures = "skip"
                webhook_secret = "hook-secret"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = config.try_deserialize().unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.log_format, Some(LogFormat::Json));
        assert_eq!(config.gpg.keyring, Some(PathBuf::from("/srv/keys.kbx")));
        assert_eq!(config.gpg.keyserver, "hkps://keys.openpgp.org");
        assert_eq!(config.dispatcher.actions, vec!["opened".to_string()]);
        assert_eq!(config.dispatcher.fork_tag_failures, ForkTagPolicy::Skip);
        assert_eq!(config.dispatcher.webhook_secret.as_deref(), Some("hook-secret"));
        assert!(config.validate().is_ok());
        assert!(config.validate_dispatcher().is_ok());
    }
}
