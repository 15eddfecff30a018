// Configuration management for the rollcall CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/rollcall/config.json
// - Linux: ~/.config/rollcall/config.json
// - Windows: %APPDATA%\rollcall\config.json

use anyhow::{Context, Result};
use rollcall_core::{Caller, Membership, ProximityConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Protocol settings shared with every device in the deployment
    pub proximity: ProximityConfig,

    /// User id used for sessions and attendance
    pub member_id: Option<String>,

    /// Organizations this member belongs to
    pub memberships: Vec<Membership>,

    /// Session database location
    pub storage_path: Option<String>,
}

impl CliConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("rollcall");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("rollcall");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: CliConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .proximity
                .validate()
                .context("Config file holds invalid proximity settings")?;
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Session database path, defaulting to the data directory
    pub fn storage_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("sessions")),
        }
    }

    /// The configured member as a datastore caller
    pub fn caller(&self) -> Result<Caller> {
        let member_id = self
            .member_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .context("No member id configured. Run `rollcall config set member_id <id>`")?;

        Ok(self
            .memberships
            .iter()
            .fold(Caller::new(member_id), |caller, m| {
                caller.with_membership(m.organization_id.clone(), m.organization_code)
            }))
    }

    /// Join an organization. Its code becomes a known beacon organization.
    pub fn join(&mut self, organization_id: &str, organization_code: u16) -> Result<()> {
        if let Some(existing) = self
            .memberships
            .iter()
            .find(|m| m.organization_code == organization_code && m.organization_id != organization_id)
        {
            anyhow::bail!(
                "Organization code {} is already used by {}",
                organization_code,
                existing.organization_id
            );
        }

        self.memberships.retain(|m| m.organization_id != organization_id);
        self.memberships.push(Membership {
            organization_id: organization_id.to_string(),
            organization_code,
        });
        if !self.proximity.known_organizations.contains(&organization_code) {
            self.proximity.known_organizations.push(organization_code);
        }
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let p = &mut self.proximity;
        match key {
            "member_id" => {
                self.member_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "service_id" => {
                p.service_id = uuid::Uuid::parse_str(value).context("Invalid UUID")?;
            }
            "known_organizations" => {
                p.known_organizations = value
                    .split(',')
                    .map(|code| code.trim().parse::<u16>())
                    .collect::<Result<_, _>>()
                    .context("Expected a comma-separated list of organization codes")?;
            }
            "auto_submit" => {
                p.auto_submit = value.parse().context("Invalid boolean value")?;
            }
            "suppression_window_secs" => {
                p.suppression_window_secs = value.parse().context("Invalid number")?;
            }
            "request_timeout_secs" => {
                p.request_timeout_secs = value.parse().context("Invalid number")?;
            }
            "session_list_ttl_secs" => {
                p.session_list_ttl_secs = value.parse().context("Invalid number")?;
            }
            "org_context_cache_capacity" => {
                p.org_context_cache_capacity = value.parse().context("Invalid number")?;
            }
            "work_queue_depth" => {
                p.work_queue_depth = value.parse().context("Invalid number")?;
            }
            "max_session_ttl_secs" => {
                p.max_session_ttl_secs = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.proximity.validate()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let p = &self.proximity;
        let codes: Vec<String> = p.known_organizations.iter().map(|c| c.to_string()).collect();
        vec![
            (
                "member_id".to_string(),
                self.member_id.clone().unwrap_or_else(|| "(unset)".to_string()),
            ),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("service_id".to_string(), p.service_id.hyphenated().to_string()),
            ("known_organizations".to_string(), codes.join(",")),
            ("auto_submit".to_string(), p.auto_submit.to_string()),
            (
                "suppression_window_secs".to_string(),
                p.suppression_window_secs.to_string(),
            ),
            ("request_timeout_secs".to_string(), p.request_timeout_secs.to_string()),
            ("session_list_ttl_secs".to_string(), p.session_list_ttl_secs.to_string()),
            (
                "org_context_cache_capacity".to_string(),
                p.org_context_cache_capacity.to_string(),
            ),
            ("work_queue_depth".to_string(), p.work_queue_depth.to_string()),
            ("max_session_ttl_secs".to_string(), p.max_session_ttl_secs.to_string()),
        ]
    }
}
