//! npmd — the node pool manager daemon.
//!
//! # Usage
//!
//! ```text
//! npmd gen-certs --out-dir ./certs --san npm.internal --san 10.0.0.5
//! npmd serve --config /etc/npmd.toml --admin-port 9121
//! npmd probe --npm 10.0.0.5:9120 --group web --mem-mb 4096 \
//!     --cert certs/npm.pem --key certs/npm-key.pem --ca certs/ca.pem
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use nodepool_cluster::tls::{generate_ca, generate_node_cert, install_crypto_provider, write_bundle};
use nodepool_cluster::{Dialer, NodePoolClient, TlsMaterial};
use nodepool_core::{CapacitySnapshot, CapacitySnapshotList, NpmConfig};
use npmd::daemon::Daemon;

#[derive(Parser)]
#[command(name = "npmd", about = "Node pool manager daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the NPM: gRPC service, reconciler, and optional admin API.
    Serve {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// gRPC port (overrides config and FN_NPM_PORT).
        #[arg(long)]
        port: Option<u16>,

        /// Admin HTTP port (overrides config and FN_NPM_ADMIN_PORT).
        #[arg(long)]
        admin_port: Option<u16>,

        /// Control plane backend (overrides config and FN_CONTROL_PLANE).
        #[arg(long)]
        control_plane: Option<String>,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate a development CA and a node certificate.
    GenCerts {
        #[arg(long, default_value = "certs")]
        out_dir: PathBuf,

        /// Base name of the node certificate files.
        #[arg(long, default_value = "npm")]
        name: String,

        /// Subject alternative name (IP or DNS). Repeatable.
        #[arg(long = "san", default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()])]
        sans: Vec<String>,
    },

    /// Advertise one snapshot to an NPM and print the group's runners.
    Probe {
        /// NPM gRPC address.
        #[arg(long, default_value = "127.0.0.1:9120")]
        npm: String,

        #[arg(long, default_value = "npmd-probe")]
        lb_id: String,

        #[arg(long)]
        group: String,

        /// Memory to request for the group, in MB.
        #[arg(long, default_value = "0")]
        mem_mb: u64,

        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        key: PathBuf,

        #[arg(long)]
        ca: PathBuf,

        /// Name to verify the NPM certificate against.
        #[arg(long)]
        server_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    install_crypto_provider();

    match cli.command {
        Command::Serve {
            config,
            port,
            admin_port,
            control_plane,
        } => {
            let mut config = load_config(config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if admin_port.is_some() {
                config.server.admin_port = admin_port;
            }
            if let Some(backend) = control_plane {
                config.control_plane.backend = backend;
            }
            run_serve(config).await
        }
        Command::Config { config } => {
            let config = load_config(config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::GenCerts {
            out_dir,
            name,
            sans,
        } => gen_certs(out_dir, &name, &sans),
        Command::Probe {
            npm,
            lb_id,
            group,
            mem_mb,
            cert,
            key,
            ca,
            server_name,
        } => {
            let material = TlsMaterial::load(&cert, &key, &ca)?;
            let dialer = Dialer::new(&material)?.with_server_name(server_name);
            let client = NodePoolClient::connect(&dialer, &npm)?;

            let list = CapacitySnapshotList::new(lb_id, vec![CapacitySnapshot::new(group.clone(), mem_mb)]);
            client
                .advertise_capacity(&list)
                .await
                .with_context(|| format!("advertising to {npm}"))?;

            let membership = client.get_lb_group(&group).await?;
            println!("{}", serde_json::to_string_pretty(&membership)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,npmd=debug,nodepool=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// File (if any), then environment.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<NpmConfig> {
    let mut config = match path {
        Some(path) => NpmConfig::from_file(&path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => NpmConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

async fn run_serve(config: NpmConfig) -> anyhow::Result<()> {
    info!(
        port = config.server.port,
        admin_port = ?config.server.admin_port,
        backend = %config.control_plane.backend,
        "node pool manager starting"
    );

    let daemon = Daemon::bind(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await
}

fn gen_certs(out_dir: PathBuf, name: &str, sans: &[String]) -> anyhow::Result<()> {
    let ca = generate_ca()?;
    let node = generate_node_cert(&ca, name, sans)?;
    let paths = write_bundle(&out_dir, name, &ca.pair, &node)?;

    println!("CA:          {}", paths.ca.display());
    println!("Certificate: {}", paths.cert.display());
    println!("Key:         {}", paths.key.display());
    Ok(())
}
