//! Headless hostlink runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hostlink_connection::{
    ChannelHooks, ConnectionEvent, ConnectionManager, FileCredentialStore, NoticeLevel,
    PairingRequest, PairingSource, WsConnector,
};
use hostlink_relay::RelayClient;
use hostlink_settings::{ConfigStore, default_config_path, default_credentials_dir};

const DELETE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "hostlink", version, about = "Keeps relay sessions to paired hosts alive")]
struct Cli {
    /// Configuration file (defaults to the platform config dir).
    #[arg(long, env = "HOSTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Credential store directory.
    #[arg(long, env = "HOSTLINK_CREDENTIALS")]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every auto-connect host and stay attached until Ctrl-C.
    Run,
    /// List paired hosts and queued deletes.
    Hosts,
    /// Pair with a host using a ticket issued by the relay.
    Pair {
        #[arg(long)]
        relay: String,
        #[arg(long)]
        system: String,
        #[arg(long)]
        ticket: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Remove a host and revoke its device grant.
    Remove { host_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hostlink=debug")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => default_config_path().context("no config directory on this platform")?,
    };
    let credentials_dir = match cli.credentials {
        Some(p) => p,
        None => default_credentials_dir().context("no config directory on this platform")?,
    };

    let config = ConfigStore::open(config_path).context("loading configuration")?;
    let bridge = FileCredentialStore::open(credentials_dir).context("opening credential store")?;
    let relay = RelayClient::new()?;
    let (hooks, events) = ChannelHooks::new(256);

    let mgr = ConnectionManager::new(
        config,
        Arc::new(bridge),
        Arc::new(relay),
        Arc::new(WsConnector::new()),
        Arc::new(hooks),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %mgr.device().device_id,
        "hostlink starting"
    );

    match cli.command {
        Command::Run => run(mgr, events).await,
        Command::Hosts => {
            list_hosts(&mgr);
            Ok(())
        }
        Command::Pair {
            relay,
            system,
            ticket,
            name,
        } => {
            let req = PairingRequest {
                relay_url: relay,
                system_id: system,
                pair_ticket: ticket,
                pair_token: String::new(),
                display_name: name,
                source: PairingSource::Manual,
            };
            let host_id = mgr.pair(req).await?;
            info!(host = %host_id, "paired");
            mgr.shutdown()?;
            Ok(())
        }
        Command::Remove { host_id } => {
            if mgr.host(&host_id).is_none() {
                bail!("unknown host {host_id}");
            }
            let queued = mgr.remove_host(&host_id)?;
            if queued {
                let report = mgr.process_pending_deletes(chrono::Utc::now()).await;
                info!(
                    resolved = report.resolved,
                    dropped = report.dropped,
                    retrying = report.retrying,
                    "delete compensation pass finished"
                );
            }
            mgr.shutdown()?;
            Ok(())
        }
    }
}

async fn run(
    mgr: ConnectionManager,
    mut events: mpsc::Receiver<ConnectionEvent>,
) -> anyhow::Result<()> {
    for (host_id, result) in mgr.connect_all_hosts().await {
        if let Err(e) = result {
            warn!(host = %host_id, error = %e, "initial connect failed");
        }
    }

    let mut sweep = tokio::time::interval(DELETE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            Some(event) = events.recv() => report(event),
            _ = sweep.tick() => {
                if mgr.pending_deletes().is_empty() {
                    continue;
                }
                let report = mgr.process_pending_deletes(chrono::Utc::now()).await;
                info!(
                    resolved = report.resolved,
                    dropped = report.dropped,
                    retrying = report.retrying,
                    "delete compensation pass finished"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    mgr.shutdown()?;
    Ok(())
}

fn report(event: ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged { host_id, status } => {
            info!(host = %host_id, %status, "host state changed");
        }
        ConnectionEvent::Notice { host_id, notice } => {
            let code = notice.code.as_deref().unwrap_or("-");
            match notice.level {
                NoticeLevel::Error => error!(host = %host_id, code, "{}", notice.message),
                NoticeLevel::Warning => warn!(host = %host_id, code, "{}", notice.message),
                NoticeLevel::Info | NoticeLevel::Success => {
                    info!(host = %host_id, code, "{}", notice.message)
                }
            }
        }
        ConnectionEvent::ToolsChanged { host_id } => info!(host = %host_id, "tools changed"),
        ConnectionEvent::CandidatesChanged { host_id } => {
            info!(host = %host_id, "candidate tools changed")
        }
        ConnectionEvent::PairingFailed(failure) => warn!(%failure, "pairing failed"),
        // Operation log entries already go through tracing when recorded.
        ConnectionEvent::Log(_) => {}
    }
}

fn list_hosts(mgr: &ConnectionManager) {
    let hosts = mgr.hosts();
    if hosts.is_empty() {
        println!("no paired hosts");
    }
    for host in hosts {
        println!(
            "{}  {}  {}  auto_connect={}",
            host.host_id,
            host.label(),
            host.relay_url,
            host.auto_connect
        );
    }
    let pending = mgr.pending_deletes();
    if !pending.is_empty() {
        println!("\npending deletes:");
        for item in pending {
            println!(
                "{}  {}  retries={}  next={}",
                item.host_id, item.system_id, item.retry_count, item.next_retry_at
            );
        }
    }
}
