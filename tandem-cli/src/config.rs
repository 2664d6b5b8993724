//! Load config from file and environment.

use anyhow::Context as _;
use serde::Deserialize;
use std::path::PathBuf;

use tandem_core::{AccountSnapshot, GameServer, SessionConfig};

/// Client configuration. File: ~/.config/tandem/config.toml or /etc/tandem/config.toml.
/// Env overrides: TANDEM_SERVER, TANDEM_AUTH_TOKEN, TANDEM_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server id to connect to at startup. None: only ping the list.
    #[serde(default)]
    pub server: Option<String>,
    /// Connect to the `standalone` entry without an auth token.
    #[serde(default)]
    pub standalone: bool,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between ping rounds (default 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(default)]
    pub account_id: i32,
    #[serde(default)]
    pub user_id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub region: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_ping_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            standalone: false,
            log_level: default_log_level(),
            ping_interval_secs: default_ping_interval(),
            account: AccountConfig::default(),
            servers: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from `var` (normally the process environment).
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("TANDEM_SERVER").filter(|s| !s.is_empty()) {
            self.server = Some(s);
        }
        if let Some(s) = var("TANDEM_AUTH_TOKEN") {
            self.account.auth_token = s;
        }
        if let Some(s) = var("TANDEM_LOG").filter(|s| !s.is_empty()) {
            self.log_level = s;
        }
    }

    pub fn game_servers(&self) -> Vec<GameServer> {
        self.servers
            .iter()
            .map(|s| {
                let name = if s.name.is_empty() { &s.id } else { &s.name };
                GameServer::new(s.id.as_str(), name.as_str(), s.host.as_str(), s.port)
                    .with_region(s.region.as_str())
            })
            .collect()
    }
}

impl AccountConfig {
    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            account_id: self.account_id,
            user_id: self.user_id,
            account_name: self.name.clone(),
            profile: Default::default(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::parse(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    c.apply_overrides(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tandem/config.toml"));
    }
    out.push(PathBuf::from("/etc/tandem/config.toml"));
    out
}
