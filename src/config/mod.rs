//! Configuration management for Weft.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flow::FlowConfig;
use crate::metrics::StatsConfig;
use crate::policy::PolicyConfig;
use crate::probe::ProbeConfig;
use crate::registry::DiscoveryConfig;
use crate::types::LinkKind;
use crate::util::parse_addr_with_default_port;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Virtual adapter configuration.
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Health probing configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Routing policy configuration.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Flow table configuration.
    #[serde(default)]
    pub flows: FlowConfig,

    /// Interface discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Per-interface overrides, matched by name.
    #[serde(default)]
    pub links: Vec<LinkConfig>,

    /// Statistics reporting configuration.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.probe.window == 0 {
            return Err(Error::InvalidConfig("probe window must be at least 1".into()));
        }

        if self.probe.hysteresis == 0 {
            return Err(Error::InvalidConfig(
                "probe hysteresis must be at least 1".into(),
            ));
        }

        if self.probe.degraded_latency.is_zero() {
            return Err(Error::InvalidConfig(
                "probe degraded_latency must be non-zero".into(),
            ));
        }

        if self.probe.targets.is_empty() {
            return Err(Error::InvalidConfig("no probe targets configured".into()));
        }

        for target in &self.probe.targets {
            if parse_addr_with_default_port(target, 53).is_err() {
                return Err(Error::InvalidConfig(format!(
                    "invalid probe target address: {target}"
                )));
            }
        }

        if self.flows.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "flow idle_timeout must be non-zero".into(),
            ));
        }

        if self.adapter.mtu < crate::MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "adapter MTU below minimum of {}",
                crate::MIN_MTU
            )));
        }

        if self.adapter.send_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "adapter send_timeout must be non-zero".into(),
            ));
        }

        for (i, link) in self.links.iter().enumerate() {
            if link.name.is_empty() {
                return Err(Error::InvalidConfig("link override with empty name".into()));
            }
            if self.links[..i].iter().any(|other| other.name == link.name) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate link override for {}",
                    link.name
                )));
            }
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("io", "weft", "weft").map_or_else(
            || PathBuf::from("weft.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            links: vec![
                LinkConfig {
                    name: "eth0".into(),
                    kind: Some(LinkKind::Wired),
                    enabled: true,
                    weight: None,
                },
                LinkConfig {
                    name: "wwan0".into(),
                    kind: Some(LinkKind::Cellular),
                    enabled: false,
                    weight: Some(20),
                },
            ],
            ..Default::default()
        }
    }

    /// Find the override for a named interface, if any.
    pub fn link_override(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.name == name)
    }
}

/// Virtual adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Name of the virtual device.
    #[serde(default = "default_adapter_name")]
    pub name: String,

    /// Maximum transmission unit for the virtual device.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Bound on a single send through a physical link; a send past this
    /// is treated as failed and enters the retry path.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Remote endpoint that per-link UDP sockets forward units to. When
    /// unset the engine runs with the in-memory link transport.
    #[serde(default)]
    pub peer: Option<SocketAddr>,
}

fn default_adapter_name() -> String {
    "weft0".into()
}
fn default_mtu() -> u16 {
    1400
}
fn default_send_timeout() -> Duration {
    Duration::from_millis(500)
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: default_adapter_name(),
            mtu: default_mtu(),
            send_timeout: default_send_timeout(),
            peer: None,
        }
    }
}

/// Per-interface override, applied when discovery registers the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Interface name, e.g. `eth0`.
    pub name: String,

    /// Override the guessed link kind.
    pub kind: Option<LinkKind>,

    /// Administratively enable or disable the link.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Override the kind-derived routing weight.
    pub weight: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path; stdout when unset.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let ansi = config.color && config.file.is_none();
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
