//! CLI binary for deploying and health-checking analytics pipelines.

mod task_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use flowdeploy_pipeline::{
    AnalyticsHandler, Compensator, EventEmitter, HealthMonitor, NodeCompiler, ParamExtractor,
    Reconciler, SelectionResolver, Worker, WorkerConfig,
};
use flowdeploy_remote::{
    build_client, FileModuleRegistry, FlowEngineClient, FlowParserClient, HttpCatalog,
    ModuleRegistry, StaticTokenExchange, TokenExchange,
};

use task_file::FileTaskSource;

#[derive(Parser)]
#[command(name = "flowdeploy", version, about = "Deploy analytics pipelines from process tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every task in a task file
    Run {
        /// Path to the worker configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Path to a JSON task or array of tasks
        #[arg(short, long)]
        tasks: PathBuf,

        /// Keep the health monitor running after the tasks until Ctrl-C
        #[arg(long)]
        with_health: bool,
    },

    /// Print the pipeline request a task would produce, without deploying it
    Compile {
        /// Path to the worker configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Path to a JSON task
        #[arg(short, long)]
        task: PathBuf,
    },

    /// Check deployed pipelines
    Health {
        /// Path to the worker configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

impl Commands {
    fn config_path(&self) -> &Path {
        match self {
            Commands::Run { config, .. }
            | Commands::Compile { config, .. }
            | Commands::Health { config, .. } => config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(cli.command.config_path())?;
    init_tracing(cli.verbose, &config);

    match cli.command {
        Commands::Run {
            tasks, with_health, ..
        } => cmd_run(&config, &tasks, with_health).await?,
        Commands::Compile { task, .. } => cmd_compile(&config, &task).await?,
        Commands::Health { once, .. } => cmd_health(&config, once).await?,
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--verbose` or `debug` selects debug, else the configured level.
fn init_tracing(verbose: bool, config: &WorkerConfig) {
    let default = if verbose || config.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The collaborators every subcommand shares.
struct Services {
    config: WorkerConfig,
    client: reqwest::Client,
    registry: Arc<FileModuleRegistry>,
    target: Arc<FlowEngineClient>,
    tokens: Arc<StaticTokenExchange>,
    events: EventEmitter,
}

impl Services {
    async fn connect(config: &WorkerConfig) -> anyhow::Result<Self> {
        let client = build_client(config.request_timeout)?;
        let registry = FileModuleRegistry::open(&config.registry_path)
            .await?
            .with_default_user(config.default_user.clone());
        let target = FlowEngineClient::new(client.clone(), config.flow_engine_url.clone())
            .with_debug(config.debug);
        Ok(Self {
            config: config.clone(),
            client,
            registry: Arc::new(registry),
            target: Arc::new(target),
            tokens: Arc::new(StaticTokenExchange::new(config.auth_token.clone())),
            events: EventEmitter::default(),
        })
    }

    fn compiler(&self) -> NodeCompiler {
        let catalog = HttpCatalog::from_urls(
            self.client.clone(),
            self.config.device_repository_url.clone(),
            self.config.import_deploy_url.clone(),
        );
        NodeCompiler::new(
            ParamExtractor::new(self.config.worker_param_prefix.clone()),
            SelectionResolver::new(Arc::new(catalog), self.config.resolver_settings()),
            Arc::new(FlowParserClient::new(
                self.client.clone(),
                self.config.flow_parser_url.clone(),
            )),
        )
    }

    fn worker(&self, source: FileTaskSource<std::io::Stdout>) -> Worker {
        let reconciler = Reconciler::new(
            self.compiler(),
            self.target.clone(),
            self.registry.clone(),
            self.config.module_type.clone(),
        );
        let handler = AnalyticsHandler::new(
            reconciler,
            self.registry.clone(),
            self.tokens.clone(),
            self.events.clone(),
        );
        let compensator = Compensator::new(
            self.target.clone(),
            self.tokens.clone(),
            self.registry.clone(),
            self.events.clone(),
        );
        Worker::new(
            Arc::new(source),
            Arc::new(handler),
            self.registry.clone(),
            compensator,
            self.events.clone(),
        )
        .with_poll_interval(self.config.poll_interval)
    }

    fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.registry.clone(),
            self.target.clone(),
            self.tokens.clone(),
            self.config.module_type.clone(),
            self.config.health_check_interval,
            self.events.clone(),
        )
    }
}

/// Flip the returned receiver to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

async fn cmd_run(config: &WorkerConfig, tasks: &Path, with_health: bool) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let worker = services.worker(FileTaskSource::open(tasks)?);

    let processed = worker.drain().await?;
    tracing::info!(processed, "All tasks processed");

    if with_health {
        services.health_monitor().run(shutdown_on_ctrl_c()).await;
    }
    Ok(())
}

async fn cmd_compile(config: &WorkerConfig, task: &Path) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let mut tasks = task_file::read_tasks(task)?;
    if tasks.len() != 1 {
        anyhow::bail!("Expected exactly one task in {}, found {}", task.display(), tasks.len());
    }
    let task = tasks.remove(0);

    let user = services
        .registry
        .instance_user(&task.process_instance_id)
        .await?;
    let token = services.tokens.exchange(&user).await?;
    let request = services.compiler().compile_request(&token, &task).await?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

async fn cmd_health(config: &WorkerConfig, once: bool) -> anyhow::Result<()> {
    let services = Services::connect(config).await?;
    let monitor = services.health_monitor();
    if once {
        let summary = monitor.sweep(None).await?;
        println!("Checked: {}", summary.checked);
        println!("Unhealthy: {}", summary.unhealthy);
        println!("Inconclusive: {}", summary.inconclusive);
        return Ok(());
    }
    monitor.run(shutdown_on_ctrl_c()).await;
    Ok(())
}
