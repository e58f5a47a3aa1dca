//! Daemon configuration management

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// System-wide configuration file, tried after the per-user one
const SYSTEM_CONFIG_PATH: &str = "/etc/ipp-usb/server.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Fleet shutdown on termination
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub log_level: String,
}

/// Which local addresses the per-device HTTP listeners bind to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInterface {
    /// 127.0.0.1 only
    #[default]
    Loopback,
    /// Every interface (0.0.0.0)
    All,
}

impl NetworkInterface {
    pub fn bind_ip(self) -> IpAddr {
        match self {
            NetworkInterface::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            NetworkInterface::All => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub interface: NetworkInterface,
    /// Lowest port handed out to a device
    #[serde(default = "NetworkSettings::default_min_port")]
    pub http_min_port: u16,
    /// Highest port handed out to a device
    #[serde(default = "NetworkSettings::default_max_port")]
    pub http_max_port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface: NetworkInterface::default(),
            http_min_port: Self::default_min_port(),
            http_max_port: Self::default_max_port(),
        }
    }
}

impl NetworkSettings {
    fn default_min_port() -> u16 {
        60000
    }

    fn default_max_port() -> u16 {
        65535
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to serve (empty = all IPP-over-USB devices)
    #[serde(default)]
    pub filters: Vec<UsbFilter>,
}

/// `VID:PID` pattern such as `0x04f9:0x0042`; `*` matches any id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbFilter {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl UsbFilter {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid.is_none_or(|v| v == vid) && self.pid.is_none_or(|p| p == pid)
    }
}

/// One half of a filter: `*` or 1-4 hex digits after `0x`
fn parse_id(part: &str) -> Result<Option<u16>> {
    if part == "*" {
        return Ok(None);
    }
    let Some(digits) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) else {
        bail!("'{}' must start with 0x", part);
    };
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{}' is not a 16-bit hex id", part);
    }
    Ok(Some(u16::from_str_radix(digits, 16)?))
}

impl FromStr for UsbFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected VID:PID, e.g. 0x04f9:*"))
            .and_then(|(vid, pid)| {
                Ok(Self {
                    vid: parse_id(vid)?,
                    pid: parse_id(pid)?,
                })
            });
        parsed.with_context(|| format!("Invalid USB filter '{}'", s))
    }
}

impl TryFrom<String> for UsbFilter {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for UsbFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = |id: Option<u16>| match id {
            Some(id) => format!("{:#06x}", id),
            None => "*".to_string(),
        };
        write!(f, "{}:{}", half(self.vid), half(self.pid))
    }
}

impl From<UsbFilter> for String {
    fn from(filter: UsbFilter) -> Self {
        filter.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// Shared deadline for stopping every device, in seconds
    #[serde(default = "ShutdownSettings::default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: Self::default_grace_period(),
        }
    }
}

impl ShutdownSettings {
    fn default_grace_period() -> u64 {
        pnp::DEFAULT_GRACE_PERIOD.as_secs()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                log_level: "info".to_string(),
            },
            network: NetworkSettings::default(),
            usb: UsbSettings::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that holds a file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.is_file())
                .ok_or_else(|| anyhow!("no configuration file found"))?,
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config =
            Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn search_paths() -> [PathBuf; 2] {
        [Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)]
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Write the configuration as TOML, creating missing directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ipp-usb").join("server.toml")
        } else {
            PathBuf::from(".config/ipp-usb/server.toml")
        }
    }

    /// Check values serde cannot check on its own
    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.server.log_level.as_str()) {
            bail!(
                "log_level '{}' is not one of {}",
                self.server.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let NetworkSettings {
            http_min_port: min,
            http_max_port: max,
            ..
        } = self.network;
        if min == 0 || min > max {
            bail!("HTTP port range {}-{} is empty or starts at 0", min, max);
        }

        if self.shutdown.grace_period_secs == 0 {
            bail!("grace_period_secs must be at least 1");
        }

        Ok(())
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    ServerConfig::load(Some(PathBuf::from(expanded)))
}
