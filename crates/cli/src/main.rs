use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use keel_core::ResourceKind;
use keel_engine::{EngineConfig, Reconciler, Runner, RunnerConfig};
use keel_kubehub::{watch, KindRegistry, KubeAccessor};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel AppService controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces); also fills a manifest's missing namespace
    #[arg(long = "namespace", env = "KEEL_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Resolve the AppService kind through discovery instead of the built-in mapping
        #[arg(long = "discover", action = ArgAction::SetTrue)]
        discover: bool,
        /// Seconds between full resync sweeps (0 disables)
        #[arg(long = "resync-secs", env = "KEEL_RESYNC_SECS", default_value_t = 300)]
        resync_secs: u64,
        /// Trigger channel capacity
        #[arg(long = "queue-cap", env = "KEEL_QUEUE_CAP", default_value_t = 1024)]
        queue_cap: usize,
    },
    /// Print the Deployment and Service synthesized for an AppService manifest
    Render {
        /// Path to an AppService YAML/JSON manifest
        file: String,
    },
    /// Validate an AppService manifest
    Check {
        /// Path to an AppService YAML/JSON manifest
        file: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let default_ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());

    match cli.command {
        Commands::Run { discover, resync_secs, queue_cap } => {
            run(cli.namespace.as_deref(), discover, resync_secs, queue_cap).await?;
        }
        Commands::Render { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?;
            let record = manifest::parse_record(&text, &default_ns)?;
            if let Err(e) = record.validate() {
                warn!(key = %record.key(), error = %e, "rendering an invalid record");
            }
            let docs = manifest::render(&record, &EngineConfig::from_env())?;
            match cli.output {
                Output::Human => {
                    for d in docs {
                        print!("---\n{}", serde_yaml::to_string(&d)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&docs)?),
            }
        }
        Commands::Check { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?;
            let record = manifest::parse_record(&text, &default_ns)?;
            match record.validate() {
                Ok(()) => match cli.output {
                    Output::Human => println!("{}: ok", record.key()),
                    Output::Json => println!("{}", serde_json::json!({ "key": record.key().to_string(), "valid": true })),
                },
                Err(e) => {
                    match cli.output {
                        Output::Human => {
                            println!("{}: invalid", record.key());
                            for p in &e.problems {
                                println!("  - {}", p);
                            }
                        }
                        Output::Json => println!(
                            "{}",
                            serde_json::json!({ "key": record.key().to_string(), "valid": false, "problems": e.problems })
                        ),
                    }
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn run(namespace: Option<&str>, discover: bool, resync_secs: u64, queue_cap: usize) -> Result<()> {
    let client = keel_kubehub::get_kube_client().await?;
    let registry = Arc::new(if discover {
        KindRegistry::discover(client.clone()).await?
    } else {
        KindRegistry::standard()
    });
    let engine_cfg = EngineConfig::from_env();
    let runner_cfg = RunnerConfig::from_env();
    info!(ns = ?namespace, finalizer = %engine_cfg.finalizer, workers = runner_cfg.workers, "controller starting");

    let accessor = Arc::new(KubeAccessor::new(client.clone(), Arc::clone(&registry)));
    let runner = Arc::new(Runner::new(Reconciler::new(accessor, engine_cfg), runner_cfg));
    let (tx, rx) = mpsc::channel(queue_cap.max(1));
    let shutdown = CancellationToken::new();

    let mut watchers = Vec::new();
    {
        let (client, registry, tx, ns) = (client.clone(), Arc::clone(&registry), tx.clone(), namespace.map(str::to_string));
        watchers.push(tokio::spawn(async move {
            if let Err(e) = watch::watch_records(client, &registry, ns.as_deref(), tx).await {
                error!(error = %e, "record watcher failed");
            }
        }));
    }
    {
        let (client, registry, tx, ns) = (client.clone(), Arc::clone(&registry), tx.clone(), namespace.map(str::to_string));
        watchers.push(tokio::spawn(async move {
            if let Err(e) = watch::watch_dependents::<Deployment>(client, &registry, ns.as_deref(), ResourceKind::Workload, tx).await {
                error!(error = %e, "deployment watcher failed");
            }
        }));
    }
    {
        let (client, registry, tx, ns) = (client.clone(), Arc::clone(&registry), tx.clone(), namespace.map(str::to_string));
        watchers.push(tokio::spawn(async move {
            if let Err(e) = watch::watch_dependents::<Service>(client, &registry, ns.as_deref(), ResourceKind::Endpoint, tx).await {
                error!(error = %e, "service watcher failed");
            }
        }));
    }
    if resync_secs > 0 {
        let (client, registry, tx, ns) = (client.clone(), Arc::clone(&registry), tx.clone(), namespace.map(str::to_string));
        let every = Duration::from_secs(resync_secs);
        watchers.push(tokio::spawn(async move {
            if let Err(e) = watch::resync_records(client, &registry, ns.as_deref(), every, tx).await {
                error!(error = %e, "resync loop failed");
            }
        }));
    }
    drop(tx);

    let runner_handle = tokio::spawn(Arc::clone(&runner).run(rx, shutdown.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received; shutting down"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C; shutting down"),
    }
    shutdown.cancel();
    for w in watchers {
        w.abort();
    }
    if let Err(e) = runner_handle.await {
        error!(error = %e, "runner task failed");
    }
    info!("controller stopped");
    Ok(())
}
