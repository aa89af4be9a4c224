//! Configuration Module
//!
//! TOML-based configuration for EdgeMQ: server binding, resource limits,
//! timing, feature flags, and the static auth/ACL collaborators. Every
//! field has a default, so an empty or absent config file is valid.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A field failed range/consistency validation
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            timing: TimingConfig::default(),
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            acl: AclConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listening endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub backlog: u32,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1883,
            backlog: 4,
        }
    }
}

/// Resource limits, all of which bound memory growth on a constrained host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_clients: usize,
    pub max_subscriptions_per_client: usize,
    pub max_topic_length: usize,
    pub max_topic_levels: usize,
    pub max_payload_size: usize,
    pub max_packet_size: usize,
    pub max_queued_messages: usize,
    pub max_inflight: u16,
    pub max_retained_messages: usize,
    pub recv_buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 10,
            max_subscriptions_per_client: 20,
            max_topic_length: 256,
            max_topic_levels: 8,
            max_payload_size: 4096,
            max_packet_size: 8192,
            max_queued_messages: 50,
            max_inflight: 10,
            max_retained_messages: 100,
            recv_buffer_size: 1024,
        }
    }
}

/// Timeouts and retry cadence, in seconds unless noted otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_secs: u64,
    pub keep_alive_factor: f64,
    pub qos_retry_interval_secs: u64,
    pub qos_max_retries: u32,
    pub no_keepalive_timeout_secs: u64,
    pub session_expiry_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            keep_alive_factor: 1.5,
            qos_retry_interval_secs: 10,
            qos_max_retries: 3,
            no_keepalive_timeout_secs: 3600,
            session_expiry_secs: 3600,
            stats_interval_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn qos_retry_interval(&self) -> Duration {
        Duration::from_secs(self.qos_retry_interval_secs)
    }
    pub fn no_keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.no_keepalive_timeout_secs)
    }
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Protocol-level feature flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub allow_anonymous: bool,
    pub allow_zero_length_clientid: bool,
    pub retain_enabled: bool,
    pub qos2_enabled: bool,
    pub sys_topics_enabled: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            allow_zero_length_clientid: true,
            retain_enabled: true,
            qos2_enabled: true,
            sys_topics_enabled: true,
        }
    }
}

/// Static credentials for the bundled dictionary auth collaborator.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Static role-based ACL for the bundled role-ACL auth collaborator.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub roles: Vec<AclRole>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config: Config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string (tests, embedding).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every numeric/consistency constraint across the
    /// configuration surface. Called after load/parse so a malformed
    /// config is rejected at startup rather than surfacing as a runtime
    /// panic or silent misbehavior later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must be nonzero".into()));
        }
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be nonzero".into(),
            ));
        }
        if self.limits.max_payload_size > self.limits.max_packet_size {
            return Err(ConfigError::Validation(
                "limits.max_payload_size cannot exceed limits.max_packet_size".into(),
            ));
        }
        if self.limits.max_topic_levels == 0 {
            return Err(ConfigError::Validation(
                "limits.max_topic_levels must be nonzero".into(),
            ));
        }
        if self.timing.keep_alive_factor < 1.0 {
            return Err(ConfigError::Validation(
                "timing.keep_alive_factor must be >= 1.0".into(),
            ));
        }
        if self.timing.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timing.connect_timeout_secs must be nonzero".into(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                if user.username.is_empty() {
                    return Err(ConfigError::Validation(
                        "auth.users entries must have a non-empty username".into(),
                    ));
                }
            }
        }

        if self.acl.enabled {
            let role_names: std::collections::HashSet<_> =
                self.acl.roles.iter().map(|r| r.name.as_str()).collect();
            for user in &self.auth.users {
                if let Some(role) = &user.role {
                    if !role_names.contains(role.as_str()) {
                        return Err(ConfigError::Validation(format!(
                            "user '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
