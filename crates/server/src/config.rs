use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PresenceMode {
    /// Presence and call state live in the shared Redis tier.
    Shared,
    /// Single-process fallback backed by in-memory maps.
    Memory,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub node_id: Option<String>,
    pub postgres_dsn: String,
    pub redis_url: String,
    pub presence_mode: PresenceMode,
    pub presence_ttl_seconds: i64,
    pub active_call_ttl_seconds: i64,
    pub pending_call_ttl_seconds: i64,
    pub fanout_limit: usize,
    pub notification_cap: i64,
    pub notification_horizon_days: i64,
    pub media_root: Option<String>,
    pub push_webhook: Option<String>,
}

/// Loads Skylark server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let node_id = override_env("SKYLARK_NODE_ID", map.remove("server.node_id"))?;
    let postgres_dsn = required(override_env(
        "SKYLARK_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let redis_url = required(override_env(
        "SKYLARK_REDIS_URL",
        map.remove("storage.redis_url"),
    )?)?;

    let presence_mode = match override_env("SKYLARK_PRESENCE_MODE", map.remove("presence.mode"))?
        .unwrap_or_else(|| "shared".to_string())
        .as_str()
    {
        "shared" => PresenceMode::Shared,
        "memory" => PresenceMode::Memory,
        _ => return Err(ConfigError::Invalid),
    };

    let presence_ttl = parse_i64(
        override_env("SKYLARK_PRESENCE_TTL", map.remove("limits.presence_ttl"))?,
        45,
    )?;
    let active_call_ttl = parse_i64(
        override_env(
            "SKYLARK_ACTIVE_CALL_TTL",
            map.remove("limits.active_call_ttl"),
        )?,
        3_600,
    )?;
    let pending_call_ttl = parse_i64(
        override_env(
            "SKYLARK_PENDING_CALL_TTL",
            map.remove("limits.pending_call_ttl"),
        )?,
        300,
    )?;
    let fanout_limit = parse_i64(
        override_env("SKYLARK_FANOUT_LIMIT", map.remove("limits.fanout_limit"))?,
        4_096,
    )?;
    if fanout_limit <= 0 || presence_ttl <= 0 || active_call_ttl <= 0 || pending_call_ttl <= 0 {
        return Err(ConfigError::Invalid);
    }
    let notification_cap = parse_i64(
        override_env(
            "SKYLARK_NOTIFICATION_CAP",
            map.remove("limits.notification_cap"),
        )?,
        100,
    )?;
    let notification_horizon = parse_i64(
        override_env(
            "SKYLARK_NOTIFICATION_HORIZON",
            map.remove("limits.notification_horizon_days"),
        )?,
        30,
    )?;

    let media_root = override_env("SKYLARK_MEDIA_ROOT", map.remove("media.root"))?;
    let push_webhook = override_env("SKYLARK_PUSH_WEBHOOK", map.remove("push.webhook"))?;

    Ok(ServerConfig {
        node_id,
        postgres_dsn,
        redis_url,
        presence_mode,
        presence_ttl_seconds: presence_ttl,
        active_call_ttl_seconds: active_call_ttl,
        pending_call_ttl_seconds: pending_call_ttl,
        fanout_limit: fanout_limit as usize,
        notification_cap,
        notification_horizon_days: notification_horizon,
        media_root,
        push_webhook,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_i64(value: Option<String>, default: i64) -> Result<i64, ConfigError> {
    value
        .unwrap_or_else(|| default.to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("skylark_test_config_minimal.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert!(config.node_id.is_none());
        assert!(config.presence_mode == PresenceMode::Shared);
        assert_eq!(config.presence_ttl_seconds, 45);
        assert_eq!(config.pending_call_ttl_seconds, 300);
        assert_eq!(config.fanout_limit, 4_096);
        assert_eq!(config.notification_cap, 100);
        assert!(config.media_root.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_full() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("skylark_test_config_full.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nnode_id=\"node-a\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[presence]\nmode=\"memory\"\n[limits]\npresence_ttl=\"20\" # seconds\nfanout_limit=\"128\"\nnotification_cap=\"50\"\n[media]\nroot=\"/var/lib/skylark/media\"\n[push]\nwebhook=\"https://push.example.org/send\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        assert!(config.presence_mode == PresenceMode::Memory);
        assert_eq!(config.presence_ttl_seconds, 20);
        assert_eq!(config.fanout_limit, 128);
        assert_eq!(config.notification_cap, 50);
        assert_eq!(config.media_root.as_deref(), Some("/var/lib/skylark/media"));
        assert_eq!(
            config.push_webhook.as_deref(),
            Some("https://push.example.org/send")
        );
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_non_positive_limits() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("skylark_test_config_invalid.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[limits]\nfanout_limit=\"0\"\n",
        )
        .unwrap();
        assert!(load_configuration(&path).is_err());
        fs::remove_file(path).unwrap();
    }
}
