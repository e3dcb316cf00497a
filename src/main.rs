use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use llmpid_api::auth::Role;
use llmpid_api::config::{Config, LogConfig};
use llmpid_api::gateway;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Env var holding the password for `add-user`, so it never lands in shell history.
const NEW_PASSWORD_ENV: &str = "LLMPID_NEW_PASSWORD";

/// Authenticated API backend for prompt-injection classification
#[derive(Parser, Debug)]
#[command(name = "llmpid-api")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to config.toml (defaults to config/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Bind host (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides gateway.port and LLMPID_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create an identity; the password is read from LLMPID_NEW_PASSWORD
    AddUser {
        #[arg(short, long)]
        username: String,

        /// admin, user or ext_sys
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Register an external system and print its access key once
    RegisterSystem {
        #[arg(short, long)]
        name: String,
    },
}

/// Rotated daily inside `log.dir` as `llmpid-api.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "llmpid-api.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Stdout output plus, when `log.dir` is set, a daily rotated file.
fn log_layers(log: &LogConfig) -> Result<Vec<BoxedLayer>> {
    let json = log.format == "json";
    let stdout = fmt::layer();
    let mut layers: Vec<BoxedLayer> = vec![if json {
        stdout.json().boxed()
    } else {
        stdout.boxed()
    }];

    if let Some(dir) = log.resolved_dir() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let file = fmt::layer()
            .with_writer(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX))
            .with_ansi(false);
        layers.push(if json { file.json().boxed() } else { file.boxed() });
    }
    Ok(layers)
}

fn init_logging(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(log_layers(log)?)
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&config.log)?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tracing::info!(
                host = %config.gateway.host,
                port = config.gateway.port,
                "Starting llmpid-api {}",
                env!("CARGO_PKG_VERSION")
            );
            gateway::run_gateway(config).await
        }
        Commands::AddUser { username, role } => {
            let role: Role = role.parse()?;
            let password = std::env::var(NEW_PASSWORD_ENV)
                .map_err(|_| anyhow!("Set {NEW_PASSWORD_ENV} to the new identity's password"))?;
            let identity = tokio::task::spawn_blocking(move || {
                let auth = gateway::build_auth_service(&config)?;
                auth.create_identity(&username, &password, role)
                    .map_err(|e| anyhow!("Failed to create identity: {e}"))
            })
            .await
            .context("add-user task panicked")??;
            println!("Created {} '{}' (id {})", identity.role, identity.username, identity.id);
            Ok(())
        }
        Commands::RegisterSystem { name } => {
            let display_name = name.clone();
            let access_key = tokio::task::spawn_blocking(move || {
                let auth = gateway::build_auth_service(&config)?;
                auth.register_external_system(&name)
                    .map_err(|e| anyhow!("Failed to register system: {e}"))
            })
            .await
            .context("register-system task panicked")??;
            println!("Registered external system '{display_name}'.");
            println!("Access key (shown once, store it now): {access_key}");
            Ok(())
        }
    }
}
