use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use platform_gateway::backends::{DirQueue, FileFrontendStore, FileServiceRegistry};
use platform_gateway::config::Config;
use platform_gateway::engine::Engine;
use platform_gateway::frontends::FrontendCatalog;
use platform_gateway::loadbalancer::LoadBalancer;
use platform_gateway::queue::{QueueApi, QueueWatcher};
use platform_gateway::server::{SecureWebServer, WebServer};
use platform_gateway::services::ServiceCatalog;
use platform_gateway::tasks::WaitGroup;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "platform-gateway")]
#[command(about = "Dynamically reconfigurable reverse proxy driven by service and frontend catalogs")]
struct Cli {
    /// Config file (default $HOME/.platform-gateway.toml)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short = 'L', long, global = true, env = "PLATFORM_GATEWAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Use JSON log format
    #[arg(short = 'J', long, global = true, env = "PLATFORM_GATEWAY_LOG_JSON")]
    log_json: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the platform gateway
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Polling duration in seconds
    #[arg(short = 'd', long, env = "PLATFORM_GATEWAY_POLLING_DURATION")]
    polling_duration: Option<u64>,

    /// Address used by the web server
    #[arg(short = 'a', long, env = "PLATFORM_GATEWAY_ADDR")]
    addr: Option<String>,

    /// Address used by the secure web server
    #[arg(short = 's', long, env = "PLATFORM_GATEWAY_SECURE_ADDR")]
    secure_addr: Option<String>,

    /// Queue name on which service events are published
    #[arg(short = 'q', long, env = "PLATFORM_GATEWAY_SERVICES_QUEUE_NAME")]
    services_queue_name: Option<String>,

    /// Queue name on which frontend events are published
    #[arg(short = 'f', long, env = "PLATFORM_GATEWAY_FRONTENDS_QUEUE_NAME")]
    frontends_queue_name: Option<String>,
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }

    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".platform-gateway.toml")
}

/// Flags override the config file
fn merge(mut config: Config, cli: &Cli) -> Config {
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(json) = cli.log_json {
        config.log_json = json;
    }

    let Commands::Run(args) = &cli.command;

    if let Some(polling) = args.polling_duration {
        config.run.polling_duration = polling;
    }
    if let Some(addr) = &args.addr {
        config.run.addr = addr.clone();
    }
    if let Some(secure_addr) = &args.secure_addr {
        config.run.secure_addr = secure_addr.clone();
    }
    if let Some(queue) = &args.services_queue_name {
        config.run.services_queue_name = queue.clone();
    }
    if let Some(queue) = &args.frontends_queue_name {
        config.run.frontends_queue_name = queue.clone();
    }

    config
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match config.log_level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" => "error",
            _ => "info",
        };
        tracing_subscriber::EnvFilter::new(format!("platform_gateway={}", level))
    });

    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(config_path(&cli))
        .context("loading configuration")
        .map(|config| merge(config, &cli))?;

    init_logging(&config);

    match &cli.command {
        Commands::Run(_) => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        addr = %config.run.addr,
        secure_addr = %config.run.secure_addr,
        polling_duration = config.run.polling_duration,
        "starting platform gateway"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // every long-lived task holds a guard; shutdown waits for all of them
    let tasks = WaitGroup::new();

    // catalog backends
    let registry = Arc::new(FileServiceRegistry::new(&config.run.services_file));
    let store = Arc::new(FileFrontendStore::new(&config.run.frontends_file));

    let queue_api: Option<Arc<dyn QueueApi>> = if config.run.queue_dir.is_empty() {
        None
    } else {
        Some(Arc::new(DirQueue::new(&config.run.queue_dir)))
    };

    let mut service_catalog = ServiceCatalog::new(registry);
    if !config.run.services_queue_name.is_empty() {
        let api = queue_api
            .clone()
            .context("servicesQueueName is set but no queueDir is configured")?;
        let watcher = QueueWatcher::new(
            api,
            &config.run.services_queue_name,
            shutdown_rx.clone(),
            &tasks,
        )
        .await
        .context("creating services queue watcher")?;
        service_catalog = service_catalog.with_watcher(watcher);
    }
    let service_catalog = Arc::new(service_catalog);

    let mut frontend_catalog = FrontendCatalog::new(store);
    if !config.run.frontends_queue_name.is_empty() {
        let api = queue_api
            .clone()
            .context("frontendsQueueName is set but no queueDir is configured")?;
        let watcher = QueueWatcher::new(
            api,
            &config.run.frontends_queue_name,
            shutdown_rx.clone(),
            &tasks,
        )
        .await
        .context("creating frontends queue watcher")?;
        frontend_catalog = frontend_catalog.with_watcher(watcher);
    }
    let frontend_catalog = Arc::new(frontend_catalog);

    // log the initial catalog contents; failures here are not fatal, the
    // engine retries on its polling schedule
    match service_catalog.list_services().await {
        Ok(names) => {
            for name in names {
                info!(name, "found service");
            }
        }
        Err(e) => error!(error = %e, "listing services"),
    }

    match frontend_catalog.list_frontends().await {
        Ok(names) => {
            for name in names {
                info!(name, "found frontend");
            }
        }
        Err(e) => error!(error = %e, "listing frontends"),
    }

    let web_server = WebServer::bind(&config.run.addr, shutdown_rx.clone(), tasks.guard())
        .await
        .context("creating web server")?;
    let secure_web_server = SecureWebServer::bind(
        &config.run.secure_addr,
        shutdown_rx.clone(),
        tasks.guard(),
    )
    .await
    .context("creating secure web server")?;

    let engine = Engine::new(
        service_catalog,
        frontend_catalog,
        Arc::new(LoadBalancer::new()),
        web_server,
        secure_web_server,
        Duration::from_secs(config.run.polling_duration),
    )
    .context("creating reconciliation engine")?;

    let engine_guard = tasks.guard();
    let engine_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        engine.run(engine_shutdown).await;
        drop(engine_guard);
    });

    // wait for SIGINT or SIGTERM
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT: stopping"),
            _ = sigterm.recv() => info!("received SIGTERM: stopping"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
        info!("received interrupt: stopping");
    }

    let _ = shutdown_tx.send(true);

    // wait for the engine, watchers, evictors and both servers to finish
    tasks.wait().await;

    info!("stopped");
    Ok(())
}
