//! Relay configuration: TOML file + CLI overrides.

use relay64_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub preflight: PreflightSection,
}

/// `[listen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ports: default_ports(),
        }
    }
}

/// `[relay]` section of the config TOML. Timeouts are in seconds; `0` or an
/// absent key disables the dial and idle timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub dial_timeout: Option<u64>,
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            dial_timeout: None,
            idle_timeout: None,
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// `[preflight]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreflightSection {
    #[serde(default = "default_ipv6_flag")]
    pub ipv6_flag: String,
}

impl Default for PreflightSection {
    fn default() -> Self {
        Self {
            ipv6_flag: default_ipv6_flag(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}
fn default_ports() -> Vec<u16> {
    vec![80, 443, 8080, 8443]
}
fn default_buffer_size() -> usize {
    1024
}
fn default_drain_timeout() -> u64 {
    5
}
fn default_ipv6_flag() -> String {
    "/proc/sys/net/ipv6/conf/all/disable_ipv6".to_string()
}

/// Values given on the command line. Each `Some` replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub ports: Option<Vec<u16>>,
    pub buffer_size: Option<usize>,
    pub dial_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub drain_timeout: Option<u64>,
    pub ipv6_flag: Option<String>,
}

/// Resolved relay configuration (paths expanded, CLI overrides applied,
/// values validated).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    pub ports: Vec<u16>,
    pub buffer_size: usize,
    pub dial_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    pub ipv6_flag_path: PathBuf,
}

impl RelayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; the defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge CLI overrides over a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let ports = overrides.ports.unwrap_or(file.listen.ports);
        if ports.is_empty() {
            return Err(RelayError::Config("at least one listen port is required".to_string()));
        }
        for (i, port) in ports.iter().enumerate() {
            if *port != 0 && ports[..i].contains(port) {
                return Err(RelayError::Config(format!("port {port} is listed twice")));
            }
        }

        let buffer_size = overrides.buffer_size.unwrap_or(file.relay.buffer_size);
        if buffer_size == 0 {
            return Err(RelayError::Config("buffer_size must be greater than 0".to_string()));
        }

        let dial_timeout = overrides.dial_timeout.or(file.relay.dial_timeout);
        let idle_timeout = overrides.idle_timeout.or(file.relay.idle_timeout);
        let drain_timeout = overrides.drain_timeout.unwrap_or(file.relay.drain_timeout);
        let ipv6_flag = overrides.ipv6_flag.unwrap_or(file.preflight.ipv6_flag);

        Ok(Self {
            bind_addr: overrides.bind.unwrap_or(file.listen.bind),
            ports,
            buffer_size,
            dial_timeout: optional_secs(dial_timeout),
            idle_timeout: optional_secs(idle_timeout),
            drain_timeout: Duration::from_secs(drain_timeout),
            ipv6_flag_path: expand_tilde_str(&ipv6_flag),
        })
    }
}

fn optional_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
