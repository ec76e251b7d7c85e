use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkg_api::AppState;
use pkg_constants::network::DEFAULT_API_PORT;
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_CONTROLLER_DATA_DIR};
use pkg_constants::state::APP_ELECTION_KEY;
use pkg_controllers::{Context, ControllerManager};
use pkg_pipeline::MemorySwitch;
use pkg_state::{KvBackend, LeaderElection, Leadership, MemoryStore, StateStore};
use pkg_types::config::{ControllerConfigFile, NatMode, NetworkingConfig, load_config_file};

#[derive(Parser, Debug)]
#[command(name = "k8snet-controller", about = "k8snet SDN control plane")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Identity used in leader election
    #[arg(long)]
    node_name: Option<String>,

    /// Keep all state in memory and lead unconditionally
    #[arg(long)]
    ephemeral: bool,

    /// Override the NAT mode (stateful | stateless)
    #[arg(long)]
    nat_mode: Option<NatMode>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Networking settings from the file, with CLI overrides on top.
fn networking_config(cli: &Cli, file: &ControllerConfigFile) -> anyhow::Result<NetworkingConfig> {
    let mut config = NetworkingConfig::from_file(&file.networking)?;
    if let Some(mode) = cli.nat_mode {
        config.nat_mode = mode;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_API_PORT);
    let data_dir = cli
        .data_dir
        .clone()
        .or(file_cfg.data_dir.clone())
        .unwrap_or_else(|| DEFAULT_CONTROLLER_DATA_DIR.to_string());
    let node_name = cli
        .node_name
        .clone()
        .or(file_cfg.node_name.clone())
        .unwrap_or_else(|| "controller-0".to_string());
    let ephemeral = cli.ephemeral || file_cfg.ephemeral.unwrap_or(false);
    let networking = networking_config(&cli, &file_cfg)?;

    info!("Starting k8snet-controller");
    info!("  Port:      {}", port);
    info!("  Node:      {}", node_name);
    info!("  NAT mode:  {}", networking.nat_mode);
    info!("  ARP mode:  {}", networking.arp_mode);

    // --- State backend and leadership ---
    let mut election = None;
    let (kv, leadership): (Arc<dyn KvBackend>, Arc<dyn Leadership>) = if ephemeral {
        info!("  Storage:   in-memory (ephemeral)");
        (
            Arc::new(MemoryStore::new()),
            Arc::new(pkg_state::StaticLeadership::leading(&node_name)),
        )
    } else {
        info!("  Data dir:  {}", data_dir);
        let kv: Arc<dyn KvBackend> = Arc::new(StateStore::new(&data_dir).await?);
        let elector = Arc::new(LeaderElection::new(
            kv.clone(),
            node_name.clone(),
            &[APP_ELECTION_KEY],
        ));
        elector.clone().start();
        election = Some(elector.clone());
        (kv, elector)
    };

    // --- Pipeline and reconcilers ---
    let switch = Arc::new(MemorySwitch::new());
    let ctx = Context::new(kv, networking, switch, leadership);
    let manager = ControllerManager::start(ctx.clone());

    // --- Reconfiguration on SIGHUP ---
    let reload_ctx = ctx.clone();
    let config_path = cli.config.clone();
    let cli_nat_mode = cli.nat_mode;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP: reloading {}", config_path);
            let reloaded = load_config_file::<ControllerConfigFile>(&config_path).and_then(|file| {
                let mut config = NetworkingConfig::from_file(&file.networking)?;
                if let Some(mode) = cli_nat_mode {
                    config.nat_mode = mode;
                }
                Ok(config)
            });
            match reloaded {
                Ok(config) => reload_ctx.config.replace(config),
                Err(e) => warn!("Config reload failed, keeping current settings: {}", e),
            }
        }
    });

    let state = AppState::new(ctx, manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tokio::select! {
        result = pkg_api::serve(addr, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Hand the lease over instead of waiting out its TTL
    if let Some(elector) = election {
        elector.resign().await?;
    }
    Ok(())
}
