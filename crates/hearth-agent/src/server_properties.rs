//! Reader for the managed server's own `server.properties`.
//!
//! This is the only place RCON credentials come from. The file is
//! re-read on demand because the operator can edit it between
//! restarts, at which point previously held credentials are invalid.

use std::{collections::BTreeMap, path::Path};

use anyhow::Context as _;
use hearth_process::RconEndpoint;

pub const DEFAULT_MAX_PLAYERS: u32 = 20;

#[derive(Debug, Clone, Default)]
pub struct ServerProperties {
    values: BTreeMap<String, String>,
}

impl ServerProperties {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { values }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read server.properties at {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_rcon_enabled(&self) -> bool {
        self.get("enable-rcon")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn max_players(&self) -> u32 {
        self.get("max-players")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_PLAYERS)
    }

    /// Builds the console endpoint, validating the same preconditions
    /// the dashboard reports to operators: RCON enabled, a usable
    /// port, and a non-empty password.
    pub fn rcon_endpoint(&self, host: &str) -> anyhow::Result<RconEndpoint> {
        if !self.is_rcon_enabled() {
            anyhow::bail!("rcon is not enabled in server.properties (need enable-rcon=true)");
        }

        let port: u16 = self
            .get("rcon.port")
            .unwrap_or("25575")
            .parse()
            .context("invalid rcon.port in server.properties")?;

        let password = self.get("rcon.password").unwrap_or_default();
        if password.is_empty() {
            anyhow::bail!("rcon.password is not set in server.properties");
        }

        Ok(RconEndpoint {
            host: host.to_string(),
            port,
            password: password.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
#Minecraft server properties
#Mon Aug 24 12:00:00 UTC 2026
enable-rcon=true
rcon.port=25575
rcon.password=hunter2
max-players=12
motd=A Vault Hunters server
";

    #[test]
    fn parses_values_and_skips_comments() {
        let props = ServerProperties::parse(SAMPLE);
        assert_eq!(props.get("motd"), Some("A Vault Hunters server"));
        assert_eq!(props.get("#Minecraft server properties"), None);
        assert_eq!(props.max_players(), 12);
    }

    #[test]
    fn endpoint_from_valid_config() {
        let props = ServerProperties::parse(SAMPLE);
        let ep = props.rcon_endpoint("localhost").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 25575);
        assert_eq!(ep.password, "hunter2");
    }

    #[test]
    fn disabled_rcon_is_rejected() {
        let props = ServerProperties::parse("enable-rcon=false\nrcon.password=x\n");
        let err = props.rcon_endpoint("localhost").unwrap_err();
        assert!(err.to_string().contains("enable-rcon"));
    }

    #[test]
    fn empty_password_is_rejected() {
        let props = ServerProperties::parse("enable-rcon=true\nrcon.password=\n");
        let err = props.rcon_endpoint("localhost").unwrap_err();
        assert!(err.to_string().contains("rcon.password"));
    }

    #[test]
    fn rcon_port_defaults_when_absent() {
        let props = ServerProperties::parse("enable-rcon=true\nrcon.password=pw\n");
        let ep = props.rcon_endpoint("localhost").unwrap();
        assert_eq!(ep.port, 25575);
    }

    #[test]
    fn max_players_defaults_to_twenty() {
        let props = ServerProperties::parse("");
        assert_eq!(props.max_players(), DEFAULT_MAX_PLAYERS);
    }
}
