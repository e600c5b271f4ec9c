use clap::Parser;
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_CONTROLLER_DATA_DIR};
use pkg_controllers::{ControllerSettings, build_controller};
use pkg_state::Store;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "authz-controller", about = "Role template binding reconciler")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Keep all state in memory
    #[arg(long)]
    in_memory: bool,

    /// Number of reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds before a failed key is retried
    #[arg(long)]
    requeue_delay_secs: Option<u64>,

    /// Seconds between full resyncs
    #[arg(long)]
    resync_interval_secs: Option<u64>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// `text` or `json`
    #[arg(long)]
    log_format: Option<String>,
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;

    // Merge: CLI args > config file > defaults
    let log_level = cli
        .log_level
        .or(file_cfg.log_level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli
        .log_format
        .or(file_cfg.log_format)
        .unwrap_or_else(|| "text".to_string());
    init_logging(&log_level, &log_format);
    info!("Config file: {}", cli.config);

    let defaults = ControllerSettings::default();
    let settings = ControllerSettings {
        workers: cli.workers.or(file_cfg.workers).unwrap_or(defaults.workers),
        requeue_delay: cli
            .requeue_delay_secs
            .or(file_cfg.requeue_delay_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.requeue_delay),
        resync_interval: cli
            .resync_interval_secs
            .or(file_cfg.resync_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval),
        dependency_delay: defaults.dependency_delay,
    };
    let in_memory = cli.in_memory || file_cfg.in_memory.unwrap_or(false);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_CONTROLLER_DATA_DIR.to_string());

    info!("Starting authz-controller");
    if in_memory {
        info!("  State:     in memory");
    } else {
        info!("  Data dir:  {}", data_dir);
    }
    info!("  Workers:   {}", settings.workers);
    info!("  Requeue:   {:?}", settings.requeue_delay);
    info!("  Resync:    {:?}", settings.resync_interval);

    let store = if in_memory {
        Store::in_memory()
    } else {
        Store::open(&data_dir).await?
    };

    let handle = build_controller(store.clone(), settings).await?.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.abort();
    store.close().await?;

    Ok(())
}
