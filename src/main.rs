use std::collections::HashMap;
use std::net::SocketAddr;

use clap::{ArgGroup, Parser};

use speechflow::config::{DashboardRegistry, Verbosity};
use speechflow::control::{osc, server, EventBus};
use speechflow::core::registry::{self, Registry};
use speechflow::core::runtime::GraphRuntime;
use speechflow::core::shutdown::{ShutdownHandle, ShutdownReason};
use speechflow::dsl;
use speechflow::stages;

/// SpeechFlow - A typed dataflow runtime for speech-processing pipelines
#[derive(Parser)]
#[command(name = "speechflow")]
#[command(author = "Keith Bugeja <keith.bugeja@um.edu.mt>")]
#[command(version)]
#[command(about = "SpeechFlow: compose audio/text stages into a running dataflow graph")]
#[command(group(
    ArgGroup::new("source")
        .args(["expression", "file", "config"])
        .required(false)
        .multiple(false)
))]
struct Cli {
    /// Inline pipeline expression
    #[arg(short = 'e', long = "expr")]
    expression: Option<String>,

    /// Pipeline expression file
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// YAML pipeline document, selecting entry `<id>@<path>`
    #[arg(short = 'c', long = "config", value_name = "ID@FILE")]
    config: Option<String>,

    /// Print every registered stage type's declared shape and exit
    #[arg(short = 'S', long = "status")]
    status: bool,

    /// Log verbosity: none, error, warning, info, debug
    #[arg(short = 'v', long = "verbosity", default_value = "info")]
    verbosity: String,

    /// Control-plane bind address
    #[arg(short = 'a', long = "addr", default_value = "127.0.0.1")]
    addr: String,

    /// Control-plane bind port; omit to disable the control plane
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Cache directory for stages that need scratch storage
    #[arg(short = 'C', long = "cache-dir")]
    cache_dir: Option<String>,

    /// Dashboard block registry: `type:id:name[,...]`
    #[arg(short = 'd', long = "dashboard")]
    dashboard: Option<String>,

    /// Mirror DASHBOARD events to a UDP OSC peer, `host:port`
    #[arg(long = "osc")]
    osc: Option<String>,

    /// Positional arguments, exposed to the pipeline expression as `argv`
    #[arg(trailing_var_arg = true)]
    argv: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let verbosity = Verbosity::parse(&cli.verbosity).unwrap_or_else(|| {
        eprintln!("unrecognised verbosity '{}', defaulting to info", cli.verbosity);
        Verbosity::Info
    });
    speechflow::config::logging::init(verbosity);

    let registry = registry::global();
    stages::register_builtin_stages(registry);

    if cli.status {
        print_status_table(registry);
        return;
    }

    if let Some(cache_dir) = &cli.cache_dir {
        tracing::debug!(cache_dir, "cache directory configured");
    }

    let dashboard = match &cli.dashboard {
        Some(spec) => match DashboardRegistry::parse(spec) {
            Ok(registry) => registry,
            Err(err) => {
                tracing::error!(%err, "invalid dashboard spec");
                std::process::exit(1);
            }
        },
        None => DashboardRegistry::default(),
    };
    tracing::info!(blocks = dashboard.len(), "dashboard registry loaded");

    let env: HashMap<String, String> = std::env::vars().collect();
    let spec = match load_graph_spec(&cli, &env) {
        Ok(spec) => spec,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let stage_ids: Vec<String> = spec.nodes.iter().map(|n| n.id.clone()).collect();
    let shutdown = ShutdownHandle::new();
    spawn_signal_handlers(shutdown.clone());

    let bus = EventBus::new();
    if let Some(osc_target) = &cli.osc {
        match osc_target.parse::<SocketAddr>() {
            Ok(target) => {
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(err) = osc::run_mirror(bus, target).await {
                        tracing::error!(%err, "OSC mirror stopped");
                    }
                });
            }
            Err(err) => tracing::error!(%err, osc_target, "invalid OSC target address, mirror disabled"),
        }
    }

    let runtime = match GraphRuntime::build(spec, registry, shutdown.clone()).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to build graph");
            std::process::exit(1);
        }
    };

    if let Some(port) = cli.port {
        let addr: SocketAddr = format!("{}:{}", cli.addr, port).parse().unwrap_or_else(|err| {
            eprintln!("invalid control-plane address '{}:{}': {err}", cli.addr, port);
            std::process::exit(1);
        });
        let bus = bus.clone();
        let command_senders = runtime.command_senders();
        let dashboard = dashboard.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve(bus, stage_ids, command_senders, dashboard, addr).await {
                tracing::error!(%err, "control plane stopped");
            }
        });
    }

    let reason = match runtime.run().await {
        Ok(reason) => reason,
        Err(err) => {
            tracing::error!(%err, "graph run failed");
            ShutdownReason::Fault
        }
    };

    tracing::info!(?reason, exit_code = reason.exit_code(), "shutting down");
    std::process::exit(reason.exit_code());
}

fn load_graph_spec(
    cli: &Cli,
    env: &HashMap<String, String>,
) -> Result<speechflow::core::runtime::GraphSpec, String> {
    if let Some(expr) = &cli.expression {
        return dsl::parse_pipeline(expr, &cli.argv, env).map_err(|e| e.to_string());
    }
    if let Some(path) = &cli.file {
        let expr = std::fs::read_to_string(path).map_err(|e| format!("reading '{path}': {e}"))?;
        return dsl::parse_pipeline(&expr, &cli.argv, env).map_err(|e| e.to_string());
    }
    if let Some(spec) = &cli.config {
        let (id, path) = spec
            .split_once('@')
            .ok_or_else(|| format!("-c expects '<id>@<file>', got '{spec}'"))?;
        let yaml = std::fs::read_to_string(path).map_err(|e| format!("reading '{path}': {e}"))?;
        return dsl::parse_yaml_pipeline(&yaml, id, &cli.argv, env).map_err(|e| e.to_string());
    }
    Err("exactly one of -e, -f or -c is required (or pass -S to list stage types)".to_string())
}

fn print_status_table(registry: &Registry) {
    println!("{:<24} {:<8} {:<8}", "TYPE", "INPUT", "OUTPUT");
    for factory in registry.list() {
        println!(
            "{:<24} {:<8} {:<8}",
            factory.type_name(),
            factory.input_kind().to_string(),
            factory.output_kind().to_string(),
        );
    }
}

/// Spawn the signal-listening task (spec §6). Every one of
/// SIGINT/SIGTERM/SIGUSR1/SIGUSR2 trips the shutdown latch with its own
/// reason and tears the graph down.
fn spawn_signal_handlers(shutdown: ShutdownHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("install SIGUSR1 handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("install SIGUSR2 handler");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, tearing down");
                    shutdown.trigger(ShutdownReason::Interrupt);
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, tearing down");
                    shutdown.trigger(ShutdownReason::Terminate);
                }
                _ = sigusr1.recv() => {
                    tracing::info!("received SIGUSR1, graceful stop");
                    shutdown.trigger(ShutdownReason::GracefulStop);
                }
                _ = sigusr2.recv() => {
                    tracing::info!("received SIGUSR2, status dump shutdown");
                    shutdown.trigger(ShutdownReason::StatusDump);
                }
            }
            if shutdown.is_triggered() {
                break;
            }
        }
    });
}
