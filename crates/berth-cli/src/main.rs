use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth::lifecycle;
use berth::rates::RateService;
use berth::repo::MemoryStore;
use berth::system::SystemManager;
use berth_config::Settings;
use berth_proxy::ProxyManager;

/// Operator CLI for the berth control plane.
///
/// The periodic subcommands (`autostop`, `collect-metrics`, `prune-metrics`,
/// `rates fetch`) are meant to be driven by cron or systemd timers. They run
/// against the configured store backend; the built-in development mode uses
/// the in-process store.
#[derive(Parser, Debug)]
#[command(name = "berth", version)]
#[command(about = "Workspace control-plane operations")]
struct Cli {
    /// Optional berth.toml overlay.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stop workspaces idle past their auto-stop threshold.
    Autostop,
    /// Sample resource metrics for every running workspace.
    CollectMetrics,
    /// Delete metrics samples older than the retention window.
    PruneMetrics {
        /// Override the configured retention window.
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Fetch today's exchange rates from the configured feed.
    RatesFetch,
    /// List the reverse-proxy routes currently configured.
    ProxyList,
    /// Print environment and tooling diagnostics.
    Doctor,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    // Development-mode store; deployments wire a database-backed `Store`.
    let store = MemoryStore::new();

    match cli.cmd {
        Commands::Autostop => {
            let provisioner = berth::provisioner::Provisioner::new(&store, &settings);
            let summary = lifecycle::auto_stop_sweep(&store, &provisioner, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CollectMetrics => {
            let system = SystemManager::new(
                settings.workspace_base_dir.clone(),
                settings.systemd_unit_dir.clone(),
            );
            let summary = lifecycle::collect_metrics(&store, &system, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::PruneMetrics { retention_days } => {
            let days = retention_days.unwrap_or(settings.metrics_retention_days);
            let dropped = lifecycle::prune_metrics(&store, days, Utc::now())?;
            println!("pruned {dropped} metric samples older than {days} days");
        }
        Commands::RatesFetch => {
            let rates = RateService::new(&store, &settings);
            let stored = rates.fetch_daily()?;
            println!("stored {stored} exchange rates");
        }
        Commands::ProxyList => {
            let proxy = ProxyManager::new(
                settings.proxy_config_path.clone(),
                settings.base_domain.clone(),
                format!("{}/api/auth/verify", settings.base_url),
            );
            let routes = proxy.list_routes()?;
            if routes.is_empty() {
                println!("no workspace routes configured");
            }
            for route in routes {
                println!("{}  {}  ->  {}", route.router, route.rule, route.backend);
            }
        }
        Commands::Doctor => doctor(&settings),
    }

    Ok(())
}

fn doctor(settings: &Settings) {
    println!("berth doctor");
    println!("  base url:        {}", settings.base_url);
    println!("  base domain:     {}", settings.base_domain);
    println!(
        "  port range:      {}-{} ({} slots)",
        settings.port_range_start,
        settings.port_range_end,
        settings.port_range_len()
    );
    println!("  workspace base:  {}", settings.workspace_base_dir);
    println!("  proxy config:    {}", settings.proxy_config_path);
    println!(
        "  gateway:         {}",
        if settings.gateway.is_configured() {
            "configured"
        } else {
            "NOT configured"
        }
    );

    println!("  tools:");
    for tool in [
        "useradd", "userdel", "chpasswd", "systemctl", "journalctl", "setquota", "ps", "git",
        "ssh-keygen", "python3", "psql", "code-server",
    ] {
        let resolved = berth_process::resolve_program(tool);
        let found = which::which(&resolved).is_ok() || std::path::Path::new(&resolved).exists();
        println!("    {:12} {}", tool, if found { "ok" } else { "MISSING" });
    }
    info!("doctor run complete");
}
