mod aws;
mod cache;
mod config;
mod env;
mod inventory;
mod lock;
mod probe;
mod readiness;
mod session;
mod status;
mod tunnel;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::aws::{AwsCli, BastionResolver, ClusterResolver};
use crate::cache::{DirCacheStore, Scope};
use crate::config::{Overrides, Settings};
use crate::inventory::StaticInventory;
use crate::session::SsmSessionLauncher;
use crate::tunnel::{ErrorKind, TrackedTunnel, TunnelError, TunnelManager};
use tunnelkeep_model::{TunnelIdentity, TunnelState, TunnelStatus};

/// Exit code for requests that cannot succeed as asked
const EXIT_BAD_REQUEST: i32 = 2;

/// Account and region used with a static inventory when none is configured
const LOCAL_SCOPE: &str = "local";

#[derive(Parser)]
#[command(name = "tk")]
#[command(about = "Open, check and close SSM port-forwarding tunnels to private databases", long_about = None)]
struct Cli {
    /// Directory for tunnel records, session logs and lock files
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// AWS account the tunnels belong to
    #[arg(long, global = true)]
    account: Option<String>,

    /// AWS region the tunnels belong to
    #[arg(long, global = true)]
    region: Option<String>,

    /// Static bastion/cluster inventory (JSON) instead of AWS lookups
    #[arg(long, global = true)]
    inventory: Option<PathBuf>,

    /// Dotenv file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TunnelArgs {
    /// Instance id of the bastion
    #[arg(long)]
    bastion: String,

    /// Name of the database cluster
    #[arg(long)]
    cluster: String,

    /// Local bind host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Local port
    #[arg(long)]
    port: u16,
}

impl TunnelArgs {
    fn identity(&self) -> TunnelIdentity {
        TunnelIdentity::new(&self.bastion, &self.cluster, &self.host, self.port)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel, or confirm it is already open
    Open(TunnelArgs),

    /// Close a tunnel
    Close(TunnelArgs),

    /// Show the state of a tunnel
    Status(TunnelArgs),

    /// Show every tracked tunnel
    List,

    /// Forget tunnels whose process has died
    Prune,
}

/// JSON output for a single tunnel
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TunnelOutput<'a> {
    key: &'a str,
    tunnel: &'a TunnelIdentity,
    #[serde(flatten)]
    state: TunnelState,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        let code = match e.downcast_ref::<TunnelError>().map(TunnelError::kind) {
            Some(ErrorKind::BadRequest) => EXIT_BAD_REQUEST,
            _ => 1,
        };
        std::process::exit(code);
    }

    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = env::load_dotenv(cli.env_file.as_deref()) {
        anyhow::bail!("Failed to load dotenv: {}", e);
    }

    let settings = Settings::from_env(Overrides {
        cache_dir: cli.cache_dir.clone(),
        account: cli.account.clone(),
        region: cli.region.clone(),
        inventory: cli.inventory.clone(),
    })?;

    let manager = build_manager(&settings).await?;
    let json = match cli.format.as_str() {
        "json" => true,
        "text" => false,
        other => anyhow::bail!("Unknown format: {}. Use text or json", other),
    };

    match cli.command {
        Commands::Open(args) => {
            let identity = args.identity();
            let state = manager.reconcile(&identity, TunnelStatus::Open).await?;
            print_tunnel(&manager.key(&identity), &identity, state, json);
        }

        Commands::Close(args) => {
            let identity = args.identity();
            let state = manager.reconcile(&identity, TunnelStatus::Closed).await?;
            print_tunnel(&manager.key(&identity), &identity, state, json);
        }

        Commands::Status(args) => {
            let identity = args.identity();
            let state = manager.status(&identity).await;
            print_tunnel(&manager.key(&identity), &identity, state, json);
        }

        Commands::List => {
            let tracked = manager.list().await?;
            print_list(&tracked, json);
        }

        Commands::Prune => {
            let pruned = manager.prune().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pruned)?);
            } else if pruned.is_empty() {
                println!("No dead tunnels");
            } else {
                for tunnel in &pruned {
                    println!("  {} {}", "✗".red(), tunnel);
                }
                println!("Pruned {} tunnel(s)", pruned.len());
            }
        }
    }

    Ok(())
}

async fn build_manager(settings: &Settings) -> anyhow::Result<TunnelManager> {
    let (bastions, clusters, scope): (Arc<dyn BastionResolver>, Arc<dyn ClusterResolver>, Scope) =
        match settings.inventory {
            Some(ref path) => {
                let inventory = Arc::new(StaticInventory::load(path)?);
                let scope = Scope::new(
                    settings.account.as_deref().unwrap_or(LOCAL_SCOPE),
                    settings.region.as_deref().unwrap_or(LOCAL_SCOPE),
                );
                (inventory.clone(), inventory, scope)
            }
            None => {
                let cli = Arc::new(AwsCli::new(&settings.aws_bin, settings.region.clone()));
                let account = match settings.account {
                    Some(ref account) => account.clone(),
                    None => cli.caller_account().await?,
                };
                let region = match settings.region {
                    Some(ref region) => region.clone(),
                    None => cli.default_region().await.unwrap_or_default(),
                };
                (cli.clone(), cli, Scope::new(account, region))
            }
        };

    let store = Arc::new(DirCacheStore::open(&settings.cache_dir, scope)?);
    let launcher = Arc::new(SsmSessionLauncher::new(&settings.aws_bin, settings.region.clone()));

    Ok(TunnelManager::new(
        store,
        bastions,
        clusters,
        launcher,
        &settings.cache_dir,
        settings.timeouts.clone(),
    ))
}

fn status_badge(state: &TunnelState) -> colored::ColoredString {
    match (state.status, state.process_id) {
        (TunnelStatus::Open, _) => "● OPEN".green(),
        (TunnelStatus::Closed, Some(_)) => "◐ CLOSED".yellow(),
        (TunnelStatus::Closed, None) => "○ CLOSED".dimmed(),
    }
}

fn print_tunnel(key: &str, tunnel: &TunnelIdentity, state: TunnelState, json: bool) {
    if json {
        let output = TunnelOutput { key, tunnel, state };
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to encode output: {}", e),
        }
        return;
    }

    let pid = state
        .process_id
        .map(|pid| format!(" (pid {})", pid))
        .unwrap_or_default();
    println!("{} {}{}", status_badge(&state), tunnel, pid.dimmed());
}

fn print_list(tracked: &[TrackedTunnel], json: bool) {
    if json {
        let output: Vec<TunnelOutput> = tracked
            .iter()
            .map(|t| TunnelOutput {
                key: &t.key,
                tunnel: &t.tunnel,
                state: t.state,
            })
            .collect();
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to encode output: {}", e),
        }
        return;
    }

    if tracked.is_empty() {
        println!("No tracked tunnels");
        return;
    }

    println!("{}", "Tunnels:".bold());
    for t in tracked {
        let pid = t
            .state
            .process_id
            .map(|pid| format!(" (pid {})", pid))
            .unwrap_or_default();
        println!("  {} {} {}{}", status_badge(&t.state), t.tunnel, t.key.dimmed(), pid.dimmed());
    }
}
