//! Weft CLI - multi-path traffic engine.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use console::Term;
use tokio::signal;

use weft::adapter::{ChannelAdapter, LinkProvider, MemoryLinks, UdpLinkProvider};
use weft::cli::*;
use weft::config::{init_logging, Config, LinkConfig};
use weft::engine::Engine;
use weft::error::Result;
use weft::metrics;
use weft::registry::{scan_links, DiscoveryConfig};
use weft::types::LinkState;
use weft::util;
use weft::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_config = weft::config::LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    init_logging(&log_config)?;

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Dispatch command
    match cli.command {
        Commands::Run(args) => run_engine(args, config).await,
        Commands::Interfaces(args) => run_interfaces(args, config),
        Commands::Config(args) => run_config(args, config),
        Commands::Completions(args) => run_completions(args),
    }
}

/// Run the engine until interrupted
async fn run_engine(args: RunArgs, mut config: Config) -> Result<()> {
    println!(
        "{}",
        "╔══════════════════════════════════════════╗".bright_cyan()
    );
    println!(
        "{}",
        "║     WEFT ENGINE                          ║".bright_cyan()
    );
    println!(
        "{}",
        format!("║     Version {}                        ║", VERSION).bright_cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════╝".bright_cyan()
    );
    println!();

    if !util::is_root() {
        println!(
            "{} Device-bound sockets need elevated privileges.",
            "⚠".yellow()
        );
        println!("  Probing may fail. Run with {} or use:", "sudo".bright_white());
        println!("    sudo setcap cap_net_raw,cap_net_admin+ep $(which weft)");
        println!();
    }

    // Command-line overrides
    if let Some(mode) = args.mode {
        config.policy.mode = mode.into();
    }
    if let Some(peer) = args.peer {
        config.adapter.peer = Some(peer);
    }
    if !args.interface.is_empty() {
        config.discovery.enabled = false;
        for name in &args.interface {
            if config.link_override(name).is_none() {
                config.links.push(LinkConfig {
                    name: name.clone(),
                    kind: None,
                    enabled: true,
                    weight: None,
                });
            }
        }
    }

    println!("{} Mode: {}", "→".cyan(), config.policy.mode);
    match config.adapter.peer {
        Some(peer) => println!("{} Peer: {}", "→".cyan(), peer),
        None => println!(
            "{} No peer endpoint configured, links run in memory.",
            "→".cyan()
        ),
    }

    // Show the links the engine will start with
    if config.discovery.enabled {
        match scan_links(&config.discovery) {
            Ok(scan) if !scan.is_empty() => {
                println!("{} Interfaces:", "→".cyan());
                for link in &scan {
                    let dot = if link.oper_up {
                        "●".green()
                    } else {
                        "○".dimmed()
                    };
                    println!("  {} {} ({})", dot, link.name.bright_white(), link.kind);
                }
            }
            Ok(_) => println!("{} No interfaces found yet; discovery will keep watching.", "⚠".yellow()),
            Err(e) => println!("{} Interface scan failed: {}", "⚠".yellow(), e),
        }
    } else {
        println!("{} Interfaces:", "→".cyan());
        for link in &config.links {
            println!("  {} {}", "●".green(), link.name.bright_white());
        }
    }
    println!();

    // The virtual adapter is channel-backed; the handle is the application
    // side and must outlive the engine run.
    let (adapter, _handle) = ChannelAdapter::pair(&config.adapter.name, config.adapter.mtu);
    let provider: Arc<dyn LinkProvider> = match config.adapter.peer {
        Some(peer) => Arc::new(UdpLinkProvider::new(peer)),
        None => Arc::new(MemoryLinks::new()),
    };
    let verbose = args.verbose;

    let engine = Engine::new(config, adapter, provider);

    println!("{} Starting...", "→".cyan());
    match engine.start().await {
        Ok(()) => println!("{} Engine running. Press Ctrl+C to stop.", "●".green()),
        Err(e) => {
            println!("{} Start failed: {}", "✗".red(), e);
            return Err(e);
        }
    }
    println!();

    // Status display loop
    if verbose {
        let term = Term::stdout();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut drawn = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = engine.status();
                    let stats = engine.stats();
                    if drawn {
                        let _ = term.clear_last_lines(4);
                    }
                    drawn = true;

                    let outage = if status.total_outage {
                        " | TOTAL OUTAGE".red().to_string()
                    } else {
                        String::new()
                    };
                    // Grade of the best usable link.
                    let quality = engine
                        .list_interfaces()
                        .iter()
                        .filter(|l| l.is_eligible())
                        .map(|l| metrics::quality_score(&l.metrics))
                        .max()
                        .map_or("n/a", metrics::quality_label);
                    println!("{}", "─".repeat(50).dimmed());
                    println!(
                        "  Links: {}/{} ({}) | Flows: {} | Loss: {:.1}%{}",
                        status.links_usable,
                        status.links_total,
                        quality,
                        status.flows,
                        stats.traffic.loss_rate * 100.0,
                        outage
                    );
                    println!(
                        "  TX: {} | RX: {} | Latency: {}",
                        util::format_bytes(stats.traffic.bytes_forwarded),
                        util::format_bytes(stats.traffic.bytes_received),
                        stats
                            .traffic
                            .latency
                            .map_or("n/a".into(), |l| format!("{:.1}ms", l.as_secs_f64() * 1000.0)),
                    );
                    println!("{}", "─".repeat(50).dimmed());
                }
                _ = signal::ctrl_c() => {
                    break;
                }
            }
        }
    } else {
        signal::ctrl_c().await.ok();
    }

    println!();
    println!("{} Shutting down...", "→".yellow());
    engine.stop().await?;
    println!("{} Engine stopped.", "●".yellow());

    Ok(())
}

/// List the interfaces discovery would hand to the engine
fn run_interfaces(args: InterfacesArgs, config: Config) -> Result<()> {
    let discovery = if args.all {
        DiscoveryConfig {
            ignore: Vec::new(),
            ..config.discovery
        }
    } else {
        config.discovery
    };

    let links = scan_links(&discovery)?;

    if args.json {
        let entries: Vec<serde_json::Value> = links
            .iter()
            .map(|l| {
                serde_json::json!({
                    "index": l.index.as_u32(),
                    "name": l.name,
                    "kind": l.kind.to_string(),
                    "state": l.initial_state().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    println!("{}", "Network Interfaces:".bright_white().bold());
    println!();

    if links.is_empty() {
        println!("  {} No candidate interfaces found", "○".dimmed());
        return Ok(());
    }

    for link in links {
        let state = link.initial_state();
        let dot = match state {
            LinkState::Down => "○".red(),
            _ => "●".green(),
        };
        println!(
            "  {} {:<12} index {:<3} {:<9} starts {}",
            dot,
            link.name.bright_white(),
            link.index,
            link.kind.to_string().dimmed(),
            state
        );
    }

    Ok(())
}

/// Show example configuration
fn run_config(args: ConfigArgs, _config: Config) -> Result<()> {
    let example = Config::example();
    let output = toml::to_string_pretty(&example)
        .map_err(|e| weft::Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)
            .map_err(|e| weft::Error::Config(format!("Failed to write config: {e}")))?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{}", output);
    }

    Ok(())
}

/// Generate shell completions
fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::generate;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
    };

    generate(shell, &mut cmd, name, &mut std::io::stdout());

    Ok(())
}
