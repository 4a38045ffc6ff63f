mod signals;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use discovery::{
    CoordinationStore, DiscoveryConfig, EtcdStore, LeasePublisher, Operation, ServiceValue,
    Update, Watcher, watch_prefix,
};
use serde_json::{Value, json};
use tonic::service::Routes;
use tracing_subscriber::EnvFilter;
use transport_grpc::{GrpcServer, GrpcServerConfig};

/// Inspect and exercise service registrations in the coordination store
#[derive(Parser)]
#[command(name = "discoveryctl", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the live instances of a service, one JSON object per line
    List { service: String },
    /// Stream membership changes of a service until interrupted
    Watch { service: String },
    /// Keep an instance registered until interrupted, then deregister it
    Register {
        service: String,
        addr: String,
        /// JSON document stored next to the address
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Run an empty gRPC server registered under `service` until interrupted
    Serve {
        service: String,
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
        /// Host to publish instead of the local IP address
        #[arg(long)]
        advertise_host: Option<String>,
    },
}

fn init_logging(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = DiscoveryConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let store = EtcdStore::connect(&config.store)
        .await
        .context("connecting to the coordination store")?;

    match cli.command {
        Commands::List { service } => list(&store, &config, &service).await,
        Commands::Watch { service } => watch(store, &config, &service).await,
        Commands::Register {
            service,
            addr,
            metadata,
        } => register(store, config, &service, &addr, metadata.as_deref()).await,
        Commands::Serve {
            service,
            listen,
            advertise_host,
        } => serve(store, config, service, listen, advertise_host).await,
    }
}

async fn list(store: &EtcdStore, config: &DiscoveryConfig, service: &str) -> Result<()> {
    let prefix = watch_prefix(&config.service_prefix, service);
    let snapshot = store
        .get_prefix(&prefix)
        .await
        .with_context(|| format!("reading {prefix}"))?;

    for entry in &snapshot.entries {
        match ServiceValue::decode(&entry.value) {
            Ok(value) => println!("{}", json!({ "addr": value.addr, "metadata": value.metadata })),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping malformed entry"),
        }
    }
    tracing::info!(revision = snapshot.revision, count = snapshot.entries.len(), "listed instances");
    Ok(())
}

fn update_line(update: &Update) -> Value {
    let op = match update.op {
        Operation::Add => "add",
        Operation::Delete => "delete",
    };
    json!({ "op": op, "addr": update.addr, "metadata": update.metadata })
}

async fn watch(store: EtcdStore, config: &DiscoveryConfig, service: &str) -> Result<()> {
    let mut watcher = Watcher::new(store, &config.service_prefix, service, config.watch.clone())
        .context("starting watcher")?;

    let shutdown = signals::wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                watcher.close();
                return result;
            }
            batch = watcher.next() => {
                for update in batch.context("watch terminated")? {
                    println!("{}", update_line(&update));
                }
            }
        }
    }
}

async fn register(
    store: EtcdStore,
    config: DiscoveryConfig,
    service: &str,
    addr: &str,
    metadata: Option<&str>,
) -> Result<()> {
    let metadata = metadata
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--metadata must be valid JSON")?;

    let publisher = LeasePublisher::new(store, config.service_prefix, config.registration)?;
    publisher.register_with_metadata(service, addr, metadata)?;
    println!("registered {service} at {addr}; press Ctrl+C to deregister");

    signals::wait_for_shutdown().await?;
    publisher
        .deregister(service, addr)
        .await
        .context("deregistering")?;
    Ok(())
}

async fn serve(
    store: EtcdStore,
    config: DiscoveryConfig,
    service: String,
    listen: SocketAddr,
    advertise_host: Option<String>,
) -> Result<()> {
    let publisher = LeasePublisher::new(store, config.service_prefix, config.registration)?;
    let mut server_config = GrpcServerConfig::new(service, listen);
    server_config.advertise_host = advertise_host;
    let server = Arc::new(GrpcServer::new(server_config, publisher)?);

    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(Routes::default()).await }
    });

    tokio::select! {
        result = &mut serving => {
            result.context("server task failed")??;
            return Ok(());
        }
        result = signals::wait_for_shutdown() => result?,
    }

    server.stop().await;
    serving.await.context("server task failed")??;
    Ok(())
}
