//! Server configuration: TOML file + CLI overrides.
//!
//! Values are validated once, here, and turned into a [`ServerConfig`];
//! nothing downstream re-checks them.

use parley_core::{ParleyError, ParleyResult, DEFAULT_MAX_FRAME_LEN};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Lowest port the relay will listen on.
pub const MIN_PORT: u16 = 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Listen address; empty means all interfaces.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            max_connections: default_max_connections(),
            io_timeout_secs: default_io_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Login attempts allowed per IP within the window (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

/// A `[[users]]` entry seeding the in-memory directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserSeed {
    pub name: String,
    pub password: String,
}

fn default_port() -> u16 {
    7777
}
fn default_max_connections() -> usize {
    64
}
fn default_io_timeout_secs() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_max_attempts() -> u32 {
    5
}
fn default_window_secs() -> u64 {
    60
}

/// Resolved server configuration (validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `None` listens on all interfaces.
    pub address: Option<IpAddr>,
    pub port: u16,
    pub max_connections: usize,
    /// Bound on any single send and on how long a login challenge stays open.
    pub io_timeout: Duration,
    /// Housekeeping cadence of the event loop.
    pub poll_interval: Duration,
    pub max_frame_len: usize,
    pub login_max_attempts: u32,
    pub login_window: Duration,
    pub users: Vec<UserSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            max_connections: default_max_connections(),
            io_timeout: Duration::from_secs(default_io_timeout_secs()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            max_frame_len: default_max_frame_len(),
            login_max_attempts: default_max_attempts(),
            login_window: Duration::from_secs(default_window_secs()),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_address: Option<&str>,
        cli_port: Option<u16>,
    ) -> ParleyResult<Self> {
        let mut file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ParleyError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        // Merge CLI overrides
        if let Some(addr) = cli_address {
            file_config.server.address = addr.to_string();
        }
        if let Some(port) = cli_port {
            file_config.server.port = port;
        }

        Self::from_file(file_config)
    }

    /// Validate a parsed config file.
    pub fn from_file(file: ConfigFile) -> ParleyResult<Self> {
        let server = file.server;
        let address = validate_address(&server.address)?;
        let port = validate_port(server.port)?;

        if server.io_timeout_secs == 0 {
            return Err(ParleyError::Config("io_timeout_secs must be positive".into()));
        }
        if server.poll_interval_ms == 0 {
            return Err(ParleyError::Config("poll_interval_ms must be positive".into()));
        }
        if server.max_connections == 0 {
            return Err(ParleyError::Config("max_connections must be positive".into()));
        }
        if server.max_frame_len == 0 {
            return Err(ParleyError::Config("max_frame_len must be positive".into()));
        }

        Ok(Self {
            address,
            port,
            max_connections: server.max_connections,
            io_timeout: Duration::from_secs(server.io_timeout_secs),
            poll_interval: Duration::from_millis(server.poll_interval_ms),
            max_frame_len: server.max_frame_len,
            login_max_attempts: file.auth.max_attempts,
            login_window: Duration::from_secs(file.auth.window_secs),
            users: file.users,
        })
    }

    /// Socket address to listen on.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}

/// Accept only unprivileged ports.
pub fn validate_port(port: u16) -> ParleyResult<u16> {
    if port < MIN_PORT {
        return Err(ParleyError::Config(format!(
            "invalid port {port}: must be between {MIN_PORT} and 65535"
        )));
    }
    Ok(port)
}

/// Empty means "all interfaces"; anything else must be a literal IP address.
pub fn validate_address(address: &str) -> ParleyResult<Option<IpAddr>> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<IpAddr>()
        .map(Some)
        .map_err(|_| ParleyError::Config(format!("invalid listen address: {trimmed}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn port_range() {
        assert!(validate_port(80).is_err());
        assert!(validate_port(1023).is_err());
        assert_eq!(validate_port(1024).unwrap(), 1024);
        assert_eq!(validate_port(65535).unwrap(), 65535);
    }

    #[test]
    fn address_forms() {
        assert_eq!(validate_address("").unwrap(), None);
        assert_eq!(
            validate_address("127.0.0.1").unwrap(),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert!(validate_address("::1").unwrap().is_some());
        assert!(validate_address("localhost").is_err());
        assert!(validate_address("300.1.1.1").is_err());
    }

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.address, None);
        assert_eq!(cfg.io_timeout, Duration::from_secs(5));
        assert_eq!(cfg.bind_addr().to_string(), "0.0.0.0:7777");
    }

    #[test]
    fn file_with_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
address = "127.0.0.1"
port = 8000
io_timeout_secs = 2

[auth]
max_attempts = 3

[[users]]
name = "alice"
password = "secret"
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), None, Some(9000)).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(cfg.io_timeout, Duration::from_secs(2));
        assert_eq!(cfg.login_max_attempts, 3);
        assert_eq!(
            cfg.users,
            vec![UserSeed {
                name: "alice".into(),
                password: "secret".into()
            }]
        );
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(ServerConfig::load(None, Some("not-an-ip"), None).is_err());
        assert!(ServerConfig::load(None, None, Some(22)).is_err());

        let mut file = ConfigFile::default();
        file.server.poll_interval_ms = 0;
        assert!(matches!(
            ServerConfig::from_file(file),
            Err(ParleyError::Config(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg =
            ServerConfig::load(Some(Path::new("/nonexistent/parley.toml")), None, None).unwrap();
        assert_eq!(cfg.port, 7777);
    }
}
