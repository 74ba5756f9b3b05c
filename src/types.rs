//! Core types used throughout Weft.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stable OS-level interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IfIndex(pub u32);

impl IfIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for IfIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Physical link type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Wired Ethernet connection
    Wired,
    /// WiFi connection
    Wireless,
    /// Cellular data (4G/5G/LTE)
    Cellular,
    /// VPN or tunnel interface
    Tunnel,
    /// Unclassified interface
    #[default]
    Unknown,
}

impl LinkKind {
    /// Default weight for links of this kind (higher = preferred).
    pub fn base_weight(self) -> u32 {
        match self {
            Self::Wired => 100,
            Self::Wireless => 80,
            Self::Cellular => 60,
            Self::Tunnel => 40,
            Self::Unknown => 30,
        }
    }

}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wired => write!(f, "wired"),
            Self::Wireless => write!(f, "wireless"),
            Self::Cellular => write!(f, "cellular"),
            Self::Tunnel => write!(f, "tunnel"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Administrative state of a link, set by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    #[default]
    Enabled,
    Disabled,
}

impl AdminState {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Operational state of a link, owned by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Recent probes all succeeded
    Up,
    /// Partially failing probes or elevated latency, still usable
    Degraded,
    /// Consecutive probe failures, traffic must route around
    Down,
}

impl LinkState {
    /// Whether traffic may be assigned to a link in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Up | Self::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Unrecoverable startup or runtime error; requires an explicit reset.
    Failed,
}

impl EngineState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Bandwidth measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Bandwidth {
    /// Bytes per second
    pub bytes_per_sec: f64,
}

impl Bandwidth {
    pub const ZERO: Self = Self { bytes_per_sec: 0.0 };

    pub fn from_bps(bytes_per_sec: f64) -> Self {
        Self { bytes_per_sec }
    }

    pub fn from_mbps(megabits_per_sec: f64) -> Self {
        Self {
            bytes_per_sec: megabits_per_sec * 125_000.0,
        }
    }

    pub fn as_mbps(self) -> f64 {
        self.bytes_per_sec / 125_000.0
    }

    pub fn as_human_readable(self) -> String {
        let bps = self.bytes_per_sec * 8.0;
        if bps >= 1_000_000_000.0 {
            format!("{:.2} Gbps", bps / 1_000_000_000.0)
        } else if bps >= 1_000_000.0 {
            format!("{:.2} Mbps", bps / 1_000_000.0)
        } else if bps >= 1_000.0 {
            format!("{:.2} Kbps", bps / 1_000.0)
        } else {
            format!("{bps:.0} bps")
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_human_readable())
    }
}

/// Live health metrics for one link, refreshed by the prober.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkMetrics {
    /// Smoothed round-trip latency, `None` until the first successful probe.
    #[serde(default, with = "humantime_serde::option")]
    pub latency: Option<Duration>,
    /// Probe loss ratio over the sliding window, 0.0..=1.0.
    pub loss: f64,
    /// Passive estimate of recently used throughput.
    pub throughput: Bandwidth,
    /// Age of the most recent probe result.
    #[serde(default, with = "humantime_serde::option")]
    pub probe_age: Option<Duration>,
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self {
            latency: None,
            loss: 0.0,
            throughput: Bandwidth::ZERO,
            probe_age: None,
        }
    }
}

impl LinkMetrics {
    pub fn latency_ms(&self) -> f64 {
        self.latency.map_or(0.0, |d| d.as_secs_f64() * 1000.0)
    }
}
