//! Command-line interface for Weft.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::policy::PolicyMode;

/// Weft - Multi-path traffic engine
#[derive(Parser, Debug)]
#[command(
    name = "weft",
    author,
    version,
    about = "Multiplex one endpoint's traffic across every usable physical link",
    long_about = r#"
Weft presents a single virtual adapter and spreads its traffic across
the physical links behind it, so flows keep moving when any one path
dies:

  - Per-flow sticky routing with pluggable selection policies
  - Continuous health probing with hysteresis-damped state changes
  - Bounded failover when a link goes down mid-traffic
  - Hotplug discovery of appearing and vanishing interfaces

QUICK START:
  Run:        weft run
  Inspect:    weft interfaces
  Configure:  weft config --output weft.toml
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine
    Run(RunArgs),

    /// List the network interfaces the engine would manage
    Interfaces(InterfacesArgs),

    /// Show example configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Use only these interfaces, skipping discovery
    /// (can be specified multiple times)
    #[arg(short, long)]
    pub interface: Vec<String>,

    /// Routing policy mode
    #[arg(short, long)]
    pub mode: Option<RoutingMode>,

    /// Remote endpoint for per-link UDP transports
    #[arg(long)]
    pub peer: Option<SocketAddr>,

    /// Show a live status line while running
    #[arg(short, long)]
    pub verbose: bool,
}

/// Interfaces command arguments
#[derive(Args, Debug)]
pub struct InterfacesArgs {
    /// Include interfaces the ignore patterns would skip
    #[arg(short, long)]
    pub all: bool,

    /// Show JSON output
    #[arg(long)]
    pub json: bool,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path; prints to stdout when unset
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Completions command arguments
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Routing policy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoutingMode {
    /// Quality-weighted blend (recommended)
    Balanced,
    /// Strict cyclic distribution
    RoundRobin,
    /// Lowest latency
    Latency,
    /// Highest throughput
    Bandwidth,
}

impl From<RoutingMode> for PolicyMode {
    fn from(m: RoutingMode) -> Self {
        match m {
            RoutingMode::Balanced => Self::Balanced,
            RoutingMode::RoundRobin => Self::RoundRobin,
            RoutingMode::Latency => Self::LatencyBased,
            RoutingMode::Bandwidth => Self::BandwidthBased,
        }
    }
}

/// Shell for completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}
