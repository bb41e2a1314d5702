use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use specular_clienthub::{shared_client, ClientKey};
use specular_core::Selector;
use specular_reflector::{EventSpec, KindSpec, PodSpec, Reflector, ReflectorConfig};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "specctl", version, about = "Run a reflector and inspect its mirror")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace; omit to watch the whole cluster
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// kubeconfig context (default: current context / in-cluster)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// Label selector, e.g. "app=x,component=server" (default: the kind's
    /// managed-resource selector)
    #[arg(short = 'l', long = "selector", global = true)]
    labels: Option<String>,

    /// Field selector, e.g. "status.phase=Running"
    #[arg(short = 'f', long = "field-selector", global = true)]
    fields: Option<String>,

    /// Forced watch restart interval in seconds
    #[arg(long = "restart-secs", global = true, default_value_t = 30)]
    restart_secs: u64,

    /// Keep following the mirror until Ctrl-C
    #[arg(long = "follow", global = true, action = ArgAction::SetTrue)]
    follow: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror managed pods
    Pods,
    /// Mirror pod events, printed as a timeline
    Events,
}

fn init_tracing() {
    let env = std::env::var("SPECULAR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPECULAR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SPECULAR_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_selector(arg: Option<&str>, what: &str) -> Result<Option<Selector>> {
    arg.map(|s| {
        Selector::from_str(s).with_context(|| format!("parsing {what} selector {s:?}"))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = ReflectorConfig {
        namespace: cli.namespace.clone(),
        labels: parse_selector(cli.labels.as_deref(), "label")?,
        fields: parse_selector(cli.fields.as_deref(), "field")?,
        restart_interval: Duration::from_secs(cli.restart_secs),
        ..Default::default()
    };

    let key = match &cli.context {
        Some(ctx) => ClientKey::for_context(ctx.clone()),
        None => ClientKey::inferred(),
    };
    let client = shared_client(key).await.context("building kube client")?;

    match cli.command {
        Commands::Pods => run_pods(&cli, (*client).clone(), config).await,
        Commands::Events => run_events(&cli, (*client).clone(), config).await,
    }
}

/// Fires when the reflector gives up reconnecting for good.
fn failure_channel() -> (specular_reflector::FailureCallback, tokio::sync::oneshot::Receiver<()>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (
        Box::new(move || {
            let _ = tx.send(());
        }),
        rx,
    )
}

async fn run_pods(cli: &Cli, client: kube::Client, config: ReflectorConfig) -> Result<()> {
    let (on_failure, failed) = failure_channel();
    let reflector = Reflector::<PodSpec>::start(client, config, Some(on_failure))
        .await
        .context("starting pod reflector")?;
    reflector.ready().await;
    print_pods(cli.output, &reflector);
    if cli.follow {
        follow(&reflector, failed, |r| print_pods(cli.output, r)).await;
        reflector.shutdown().await;
    }
    Ok(())
}

async fn run_events(cli: &Cli, client: kube::Client, config: ReflectorConfig) -> Result<()> {
    let (on_failure, failed) = failure_channel();
    let reflector = Reflector::<EventSpec>::start(client, config, Some(on_failure))
        .await
        .context("starting event reflector")?;
    reflector.ready().await;
    print_events(cli.output, &reflector);
    if cli.follow {
        follow(&reflector, failed, |r| print_events(cli.output, r)).await;
        reflector.shutdown().await;
    }
    Ok(())
}

/// Re-print the mirror periodically until Ctrl-C or reflector failure.
async fn follow<S, F>(
    reflector: &Reflector<S>,
    mut failed: tokio::sync::oneshot::Receiver<()>,
    print: F,
) where
    S: KindSpec,
    F: Fn(&Reflector<S>),
{
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    ticker.tick().await; // first tick fires immediately
    // Every applied event swaps the snapshot, so pointer identity catches
    // in-place modifications the map size would miss.
    let mut last = reflector.store();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted, stopping reflector");
                break;
            }
            _ = &mut failed => {
                error!("reflector gave up; mirror is stale, exiting");
                break;
            }
            _ = ticker.tick() => {
                let current = reflector.store();
                if !Arc::ptr_eq(&current, &last) {
                    last = current;
                    print(reflector);
                }
            }
        }
    }
}

fn print_pods(output: Output, reflector: &Reflector<PodSpec>) {
    let snapshot = reflector.store();
    match output {
        Output::Human => {
            println!("{} pod(s) mirrored", snapshot.len());
            let mut keys: Vec<_> = snapshot.keys().collect();
            keys.sort();
            for key in keys {
                let pod = &snapshot[key];
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Unknown");
                println!("{key}\t{phase}");
            }
        }
        Output::Json => print_json(snapshot.iter().map(|(k, v)| (k.clone(), &**v))),
    }
}

fn print_events(output: Output, reflector: &Reflector<EventSpec>) {
    match output {
        Output::Human => {
            let events = reflector.sorted_events();
            println!("{} event(s) mirrored", events.len());
            for ev in events {
                let when = ev
                    .last_timestamp
                    .as_ref()
                    .map(|t| t.0.to_rfc3339())
                    .or_else(|| ev.event_time.as_ref().map(|t| t.0.to_rfc3339()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{when}\t{}\t{}",
                    ev.reason.as_deref().unwrap_or("-"),
                    ev.message.as_deref().unwrap_or("-"),
                );
            }
        }
        Output::Json => {
            let snapshot = reflector.store();
            print_json(snapshot.iter().map(|(k, v)| (k.clone(), &**v)));
        }
    }
}

fn print_json<'a, T: serde::Serialize + 'a>(entries: impl Iterator<Item = (String, &'a T)>) {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k, v)))
        .collect();
    match serde_json::to_string_pretty(&serde_json::Value::Object(map)) {
        Ok(s) => println!("{s}"),
        Err(e) => error!(error = %e, "failed to serialize mirror"),
    }
}
