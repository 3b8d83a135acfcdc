//! Configuration loading and validation.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_sid")]
    pub sid: String,
    /// Optional connection password checked at registration.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub motd: Vec<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_network() -> String {
    "CometNet".to_string()
}
fn default_description() -> String {
    "comet IRC daemon".to_string()
}
fn default_sid() -> String {
    "001".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:6667".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub nicklen: usize,
    pub channellen: usize,
    pub topiclen: usize,
    pub awaylen: usize,
    /// Hard outbound-queue capacity in messages; overflow disconnects.
    pub sendq_hard: usize,
    /// Remaining-capacity threshold that triggers the soft warning.
    pub sendq_soft: usize,
    /// Max entries per ban-style list.
    pub maxlist: usize,
    /// Seconds a client must wait between KNOCKs.
    pub knock_delay: u64,
    /// Seconds a channel shields itself between KNOCKs from anyone.
    pub knock_delay_channel: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            nicklen: 31,
            channellen: 50,
            topiclen: 390,
            awaylen: 200,
            sendq_hard: 512,
            sendq_soft: 64,
            maxlist: 100,
            knock_delay: 300,
            knock_delay_channel: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdleTimeoutsConfig {
    /// Idle seconds before the server sends PING.
    pub ping: u64,
    /// Further seconds without PONG before disconnect.
    pub timeout: u64,
}

impl Default for IdleTimeoutsConfig {
    fn default() -> Self {
        Self {
            ping: 90,
            timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Messages allowed per window before violations accrue.
    pub messages: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Violations tolerated before disconnect.
    pub max_violations: u8,
    /// New connections allowed per source prefix per window.
    pub connections: u32,
    /// Prefix length grouping v4 sources for the connection limiter.
    pub v4_prefix: u8,
    /// Prefix length grouping v6 sources for the connection limiter.
    pub v6_prefix: u8,
    /// Per-CIDR overrides of the connection budget.
    #[serde(rename = "cidr")]
    pub cidr_overrides: Vec<CidrLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages: 10,
            window_secs: 10,
            max_violations: 3,
            connections: 20,
            v4_prefix: 32,
            v6_prefix: 64,
            cidr_overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CidrLimit {
    pub net: String,
    pub connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperBlock {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub idle_timeouts: IdleTimeoutsConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default, rename = "oper")]
    pub oper_blocks: Vec<OperBlock>,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.is_empty() || !self.server.name.contains('.') {
            return Err(ConfigError::Invalid(
                "server.name must be a dotted hostname".to_string(),
            ));
        }
        if self.server.sid.len() != 3 {
            return Err(ConfigError::Invalid(
                "server.sid must be exactly three characters".to_string(),
            ));
        }
        if self.limits.sendq_soft >= self.limits.sendq_hard {
            return Err(ConfigError::Invalid(
                "limits.sendq_soft must be below limits.sendq_hard".to_string(),
            ));
        }
        for block in &self.ratelimit.cidr_overrides {
            block.net.parse::<ipnet::IpNet>().map_err(|e| {
                ConfigError::Invalid(format!("bad ratelimit cidr {}: {e}", block.net))
            })?;
        }
        self.listen
            .addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("bad listen.addr: {e}")))?;
        Ok(())
    }

    /// A config suitable for tests: no sockets are opened from it.
    pub fn for_testing() -> Config {
        Config {
            server: ServerConfig {
                name: "comet.test".to_string(),
                network: default_network(),
                description: default_description(),
                sid: default_sid(),
                password: None,
                motd: Vec::new(),
                log_format: LogFormat::Pretty,
            },
            listen: ListenConfig::default(),
            limits: LimitsConfig::default(),
            idle_timeouts: IdleTimeoutsConfig::default(),
            ratelimit: RateLimitConfig::default(),
            oper_blocks: vec![OperBlock {
                name: "admin".to_string(),
                password: "hunter2".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let file = write_config("[server]\nname = \"irc.example.net\"\n");
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.network, "CometNet");
        assert_eq!(config.listen.addr, "127.0.0.1:6667");
        assert_eq!(config.limits.nicklen, 31);
        assert_eq!(config.limits.knock_delay, 300);
        assert_eq!(config.idle_timeouts.ping, 90);
        assert!(config.oper_blocks.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            r#"
[server]
name = "irc.example.net"
network = "ExampleNet"
sid = "042"
motd = ["line one", "line two"]

[listen]
addr = "0.0.0.0:6697"

[limits]
sendq_hard = 1024
sendq_soft = 128

[ratelimit]
messages = 20
[[ratelimit.cidr]]
net = "10.0.0.0/8"
connections = 100

[[oper]]
name = "admin"
password = "hunter2"
"#,
        );
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.sid, "042");
        assert_eq!(config.ratelimit.cidr_overrides.len(), 1);
        assert_eq!(config.oper_blocks[0].name, "admin");
    }

    #[test]
    fn rejects_undotted_server_name() {
        let file = write_config("[server]\nname = \"localhost\"\n");
        assert!(matches!(
            Config::load(file.path().to_str().unwrap()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_bad_cidr() {
        let file = write_config(
            "[server]\nname = \"irc.example.net\"\n[[ratelimit.cidr]]\nnet = \"not-a-net\"\nconnections = 1\n",
        );
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }
}
