use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use meshd_api::{Adapter, MeshApi, SessionConfig};
use meshd_core::{Event, OperationRequest, Severity};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshctl", version, about = "Drive the Linkerd mesh adapter from the command line")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig file (empty: in-cluster / default loading rules)
    #[arg(long = "kubeconfig", env = "KUBECONFIG", global = true)]
    kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported operations
    Ops,
    /// Run an operation and follow its outcome event
    Apply {
        /// Operation key, e.g. "install_http_bin" or "custom"
        #[arg(long = "op")]
        op: String,
        /// Target namespace
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
        /// Remove instead of deploy
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
        /// Manifest file for the custom operation ("-" for stdin)
        #[arg(long = "file", short = 'f')]
        file: Option<String>,
        /// Requester identity substituted into sample templates
        #[arg(long = "user")]
        user: Option<String>,
        /// Operation id (random when omitted)
        #[arg(long = "id")]
        id: Option<String>,
    },
    /// Print the managed mesh name
    MeshName,
}

fn init_tracing() {
    let env = std::env::var("MESHD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MESHD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MESHD_METRICS_ADDR; expected host:port");
        }
    }
}

async fn read_body(path: &str) -> Result<String> {
    if path == "-" {
        use tokio::io::AsyncReadExt;
        let mut s = String::new();
        tokio::io::stdin().read_to_string(&mut s).await.context("reading manifest from stdin")?;
        return Ok(s);
    }
    tokio::fs::read_to_string(path).await.with_context(|| format!("reading manifest {}", path))
}

fn print_event(ev: &Event, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            let line = if ev.details.is_empty() { ev.summary.clone() } else { format!("{} • {}", ev.summary, ev.details) };
            match ev.severity {
                Severity::Error => eprintln!("[{}] {} {}", ev.severity, ev.operation_id, line),
                _ => println!("[{}] {} {}", ev.severity, ev.operation_id, line),
            }
        }
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = Arc::new(Adapter::new(SessionConfig::from_env()));

    match cli.command {
        Commands::Ops => {
            let ops = api.supported_operations().await?;
            match cli.output {
                Output::Human => {
                    for op in ops {
                        println!("{} • {} • {:?}", op.key, op.display_name, op.category);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ops)?),
            }
        }
        Commands::MeshName => println!("{}", api.mesh_name()),
        Commands::Apply { op, namespace, delete, file, user, id } => {
            let t0 = Instant::now();
            let kubeconfig = match cli.kubeconfig.as_deref().filter(|p| !p.is_empty()) {
                Some(path) => tokio::fs::read(path).await.with_context(|| format!("reading kubeconfig {}", path))?,
                None => Vec::new(),
            };
            api.create_instance(&kubeconfig, cli.context.as_deref()).await?;
            let custom_body = match file.as_deref() {
                Some(path) => Some(read_body(path).await?),
                None => None,
            };
            let operation_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let req = OperationRequest { operation_id: operation_id.clone(), op_name: op.clone(), namespace, delete_op: delete, custom_body, username: user };
            info!(op = %op, op_id = %operation_id, "apply invoked");

            let background = meshd_ops::registry::descriptor(&op).map(|d| d.source != meshd_ops::ManifestSource::RequestBody).unwrap_or(false);
            let ack = match api.apply_operation(req).await {
                Ok(ack) => ack,
                Err(e) => {
                    error!(error = %e, "apply failed");
                    eprintln!("apply error: {}", e);
                    std::process::exit(1);
                }
            };
            if !background {
                println!("{} applied ({} ms)", ack.operation_id, t0.elapsed().as_millis());
                return Ok(());
            }

            let (mut tx, mut rx) = mpsc::channel::<Event>(16);
            let streaming = {
                let api = api.clone();
                tokio::spawn(async move { api.stream_events(&mut tx).await })
            };
            let mut failed = false;
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        warn!("interrupted; abandoning operation");
                        failed = true;
                        break;
                    }
                    ev = rx.recv() => {
                        let Some(ev) = ev else { break };
                        print_event(&ev, cli.output)?;
                        if ev.operation_id == ack.operation_id {
                            failed = ev.severity == Severity::Error;
                            break;
                        }
                    }
                }
            }
            api.shutdown();
            if let Ok(Err(e)) = streaming.await {
                warn!(error = %e, "event stream ended with error");
            }
            info!(took_ms = %t0.elapsed().as_millis(), "apply done");
            if failed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
