//! RelayKeep daemon
//!
//! Loads the configuration, keeps every open server group connected and
//! reloads the file on SIGHUP.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use relaykeep::config::seal;
use relaykeep::config::{ConfigArena, ConfigStorage, ConfigStore};
use relaykeep::session::{SessionManager, StatusEvent};
use relaykeep::ssh::Socks5Proxy;
use relaykeep::transport::SshTransport;

/// RelayKeep - keep SSH port forwards and reverse tunnels running
#[derive(Parser, Debug)]
#[command(name = "relaykeep")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.relaykeep/config.json)
    #[arg(short, long, global = true, env = "RELAYKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Passphrase for the sealed configuration form
    #[arg(long, global = true, env = "RELAYKEEP_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Also write logs to daily rotated files in this directory
    #[arg(long, global = true, env = "RELAYKEEP_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel daemon (default)
    Run,
    /// Validate the configuration and print a summary
    Check,
    /// Rewrite the configuration file in sealed form
    Seal,
    /// Rewrite a sealed configuration file as plain JSON
    Unseal,
}

impl Cli {
    fn storage(&self) -> Result<ConfigStorage> {
        let storage = match &self.config {
            Some(path) => ConfigStorage::with_path(path),
            None => ConfigStorage::new().context("Failed to locate the config file")?,
        };
        Ok(match &self.passphrase {
            Some(passphrase) => storage.with_passphrase(passphrase.clone()),
            None => storage,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard =
        relaykeep::init_logging(cli.log_dir.as_deref()).context("Failed to open the log directory")?;

    match &cli.command {
        None | Some(Commands::Run) => run(cli.storage()?).await,
        Some(Commands::Check) => check(cli.storage()?).await,
        Some(Commands::Seal) => reseal(&cli, true).await,
        Some(Commands::Unseal) => reseal(&cli, false).await,
    }
}

async fn run(storage: ConfigStorage) -> Result<()> {
    let mut store = ConfigStore::open(storage)
        .await
        .context("Failed to load configuration")?;

    let settings = store.arena().settings().clone();
    let proxy = Socks5Proxy::from_env();
    if let Some(ref proxy) = proxy {
        info!("Dialing through SOCKS5 proxy {:?}", proxy);
    }
    let transport = SshTransport::new(settings.keepalive_timeout()).with_proxy(proxy);

    let manager = SessionManager::spawn(&store.snapshot(), Arc::new(transport))
        .context("Failed to start session manager")?;

    tokio::spawn(log_status(manager.clone()));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup()).context("Failed to watch SIGHUP")?;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading {:?}", store.storage().path());
                    match store.reload().await {
                        Ok(intent) => {
                            if let Err(e) = manager.submit(intent).await {
                                error!("Reloaded configuration rejected: {}", e);
                            }
                        }
                        Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for ctrl-c")?;
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}

async fn log_status(manager: SessionManager) {
    let mut events = manager.subscribe();
    loop {
        match events.recv().await {
            Ok(StatusEvent::ServerChanged {
                server_id,
                state,
                health,
                reconnect_attempt,
                error,
                ..
            }) => match error {
                Some(error) => warn!(
                    "Server {} is {} ({:?}, attempt {}): {}",
                    server_id, state, health, reconnect_attempt, error
                ),
                None => info!("Server {} is {} ({:?})", server_id, state, health),
            },
            Ok(StatusEvent::LinkChanged {
                server_id,
                link_id,
                state,
            }) => info!("Link {}/{} is {}", server_id, link_id, state),
            Ok(StatusEvent::LinkStats { .. }) => {}
            Ok(StatusEvent::ServerRemoved { server_id }) => {
                info!("Server {} removed", server_id)
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Status log lagged, {} event(s) skipped", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn check(storage: ConfigStorage) -> Result<()> {
    let config = storage
        .load()
        .await
        .with_context(|| format!("Failed to read {:?}", storage.path()))?;
    let arena = ConfigArena::from_config(&config).context("Configuration is invalid")?;

    println!("{}: {} server group(s)", storage.path().display(), arena.len());
    for server in &config.config {
        let open = server.link_group.iter().filter(|l| l.is_open).count();
        println!(
            "  {} [{}] {}@{}:{} - {} link(s), {} open{}",
            server.display_name(),
            server.id,
            server.username,
            server.server_host,
            server.server_port,
            server.link_group.len(),
            open,
            if server.is_open { "" } else { " (closed)" }
        );
    }
    Ok(())
}

/// Rewrite the file in sealed (`to_sealed`) or plain form
async fn reseal(cli: &Cli, to_sealed: bool) -> Result<()> {
    let Some(passphrase) = cli.passphrase.clone() else {
        bail!("A passphrase is required (--passphrase or RELAYKEEP_PASSPHRASE)");
    };
    let source = cli.storage()?;
    if !source.exists().await {
        bail!("No configuration file at {:?}", source.path());
    }

    let contents = tokio::fs::read_to_string(source.path())
        .await
        .with_context(|| format!("Failed to read {:?}", source.path()))?;
    if seal::is_sealed(&contents) == to_sealed {
        info!(
            "{:?} is already {}",
            source.path(),
            if to_sealed { "sealed" } else { "plain" }
        );
        return Ok(());
    }

    let config = source.load().await.context("Failed to load configuration")?;
    ConfigArena::from_config(&config).context("Configuration is invalid")?;

    let target = ConfigStorage::with_path(source.path());
    let target = if to_sealed {
        target.with_passphrase(passphrase)
    } else {
        target
    };
    target.save(&config).await.context("Failed to write configuration")?;

    info!(
        "{:?} written in {} form",
        target.path(),
        if to_sealed { "sealed" } else { "plain" }
    );
    Ok(())
}
