//! `htsp-probe.toml` file format.

use std::path::Path;
use std::time::Duration;

use htsp_client::ConnectionConfig;
use serde::Deserialize;

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    /// Seconds.
    pub request_timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

impl ServerSection {
    /// Connection settings from this section, defaults for the rest.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.htsp_port = port;
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(client_name) = &self.client_name {
            config.client_name = client_name.clone();
        }
        if let Some(secs) = self.request_timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_file() {
        let config: ConfigFile = toml::from_str(
            r#"
            [server]
            host = "tvh.local"
            port = 9983
            username = "kodi"
            password = " hunter2 "
            request_timeout = 10

            [logging]
            retention_days = 3
            level = "debug"
            "#,
        )
        .unwrap();

        let conn = config.server.to_connection_config();
        assert_eq!(conn.host, "tvh.local");
        assert_eq!(conn.htsp_port, 9983);
        assert_eq!(conn.username, "kodi");
        assert_eq!(conn.password, " hunter2 ");
        assert_eq!(conn.request_timeout, Duration::from_secs(10));
        assert_eq!(conn.retry_interval, Duration::from_secs(2));
        assert_eq!(config.logging.retention_days, Some(3));
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        let conn = config.server.to_connection_config();
        assert_eq!(conn.host, "127.0.0.1");
        assert_eq!(conn.htsp_port, 9982);
        assert!(config.logging.level.is_none());
    }
}
