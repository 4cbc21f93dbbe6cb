use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use anyhow::{Result, Context};
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub ts: TsConfig,
    pub chat: ChatConfig,
    pub webhook: WebhookConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TsConfig {
    pub host: String,
    pub ticket_url_prefix: String,
    pub api: TsApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TsApiConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub protocol: String,
    pub port: String,
    pub insecure_connection: bool,
    pub get_ticket_detail_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub default_interval_secs: i64,
}

/// Teams are a closed enumeration; any subscription or binding naming a team
/// outside this set must be rejected before it reaches the Store.
pub const KNOWN_TEAMS: [&str; 3] = ["Team1", "Team2", "Team3"];

impl Default for Config {
    fn default() -> Self {
        let data_dir = Self::get_config_dir();

        Self {
            ts: TsConfig {
                host: String::new(),
                ticket_url_prefix: String::new(),
                api: TsApiConfig {
                    login: String::new(),
                    password: String::new(),
                    protocol: "https".to_string(),
                    port: "443".to_string(),
                    insecure_connection: false,
                    get_ticket_detail_path: "/otrs/nph-genericinterface.pl/Webservice/GenericTicketConnectorREST/TicketGet".to_string(),
                },
            },
            chat: ChatConfig {
                token: String::new(),
            },
            webhook: WebhookConfig {
                bind_addr: "0.0.0.0".to_string(),
                port: 8088,
            },
            store: StoreConfig {
                database_path: data_dir.join("relay.db"),
                max_connections: 5,
            },
            scheduler: SchedulerConfig {
                default_interval_secs: 300,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = Self::get_config_dir();
        let config_file = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("Loading configuration from: {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let mut content = String::new();
        content.push_str("# otrs-relay configuration\n");
        content.push_str("# \n");
        content.push_str("# Secrets (ts.api.login, ts.api.password, chat.token) may be left blank here\n");
        content.push_str("# and supplied instead via environment variables:\n");
        content.push_str("#   TS_API_LOGIN, TS_API_PASSWORD, CHAT_TOKEN\n");
        content.push_str("\n");

        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;
        content.push_str(&config_content);

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    fn load_from_env(&mut self) -> Result<()> {
        if let Ok(login) = std::env::var("TS_API_LOGIN") {
            if !login.is_empty() {
                self.ts.api.login = login;
                info!("Loaded TS API login from environment");
            }
        }

        if let Ok(password) = std::env::var("TS_API_PASSWORD") {
            if !password.is_empty() {
                self.ts.api.password = password;
                info!("Loaded TS API password from environment");
            }
        }

        if let Ok(token) = std::env::var("CHAT_TOKEN") {
            if !token.is_empty() {
                self.chat.token = token;
                info!("Loaded chat token from environment");
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.ts.host.is_empty() {
            missing.push("ts.host");
        }
        if self.ts.ticket_url_prefix.is_empty() {
            missing.push("ts.ticket_url_prefix");
        }
        if self.ts.api.login.is_empty() {
            missing.push("ts.api.login (or TS_API_LOGIN)");
        }
        if self.ts.api.password.is_empty() {
            missing.push("ts.api.password (or TS_API_PASSWORD)");
        }
        if self.ts.api.protocol.is_empty() {
            missing.push("ts.api.protocol");
        }
        if self.ts.api.get_ticket_detail_path.is_empty() {
            missing.push("ts.api.get_ticket_detail_path");
        }
        if self.chat.token.is_empty() {
            missing.push("chat.token (or CHAT_TOKEN)");
        }
        if !self.store.database_path.is_absolute() {
            anyhow::bail!("store.database_path must be an absolute path");
        }
        if self.scheduler.default_interval_secs <= 0 {
            anyhow::bail!("scheduler.default_interval_secs must be positive");
        }

        if !missing.is_empty() {
            anyhow::bail!(
                "\nMissing mandatory configuration field(s):\n{}\n",
                missing.iter().map(|f| format!("  - {}", f)).collect::<Vec<_>>().join("\n")
            );
        }

        Ok(())
    }

    pub fn get_config_dir() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".otrs_relay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fully_populated_config_validates() {
        let mut config = Config::default();
        config.ts.host = "otrs.example.com".to_string();
        config.ts.ticket_url_prefix = "https://otrs.example.com/ticket/".to_string();
        config.ts.api.login = "api-user".to_string();
        config.ts.api.password = "secret".to_string();
        config.chat.token = "chat-token".to_string();
        assert!(config.validate().is_ok());
    }
}
