//! tunrot daemon
//!
//! Keeps a host's rotated traffic on a regularly rotated tunnel while the
//! operator session and other protected flows stay on the host's own path.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tunrot_core::classifier::session_address_from_env;
use tunrot_core::config::{self, Config};
use tunrot_core::TrafficClassifier;
use tunrot_daemon::backoff::{Backoff, BackoffPolicy};
use tunrot_daemon::blacklist::{unix_secs, BlacklistStore};
use tunrot_daemon::catalog::{policy_for, CandidateCatalog};
use tunrot_daemon::control::{ControlLoop, REQUEST_QUEUE};
use tunrot_daemon::health::{HealthMonitor, HealthSettings};
use tunrot_daemon::routing::{IpRouteBackend, RoutingSwitch};
use tunrot_daemon::scheduler::{RotationScheduler, RotationSettings};
use tunrot_daemon::slot::{
    EgressProbe, HttpEgressProbe, OpenVpnTransport, SlotPair, TunnelTransport,
};
use tunrot_daemon::status;

/// Attempts at detecting the host's own egress address at startup.
const HOST_PROBE_ATTEMPTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "tunrot")]
#[command(version, about = "tunrot - tunnel rotation and health daemon")]
struct Args {
    /// Config file (default: /etc/tunrot/tunrot.toml if present)
    #[arg(long, global = true, env = "TUNROT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "TUNROT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TUNROT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rotation daemon (default).
    Run {
        /// Directory of candidate profiles
        #[arg(long)]
        profile_dir: Option<PathBuf>,

        /// Seconds between periodic rotations
        #[arg(long)]
        rotation_interval: Option<u64>,

        /// The host's own egress address (skips detection)
        #[arg(long, env = "TUNROT_HOST_ADDRESS")]
        host_address: Option<IpAddr>,
    },
    /// Show the daemon's current state.
    Status {
        /// Status file written by the daemon
        #[arg(long)]
        status_path: Option<PathBuf>,

        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Remove the classifier chain and fwmark rule installed by the daemon.
    ResetRouting,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    let log_json = args.log_json || config.daemon.log_json;
    let log_filter = format!(
        "tunrot_daemon={level},tunrot_core={level},tunrot::audit=info",
        level = config.daemon.log_level
    );
    tunrot_core::tracing_init::init_tracing(&log_filter, log_json);

    match args.command.unwrap_or(Command::Run {
        profile_dir: None,
        rotation_interval: None,
        host_address: None,
    }) {
        Command::Run {
            profile_dir,
            rotation_interval,
            host_address,
        } => {
            if let Some(dir) = profile_dir {
                config.catalog.profile_dir = dir;
            }
            if let Some(secs) = rotation_interval {
                config.rotation.interval_secs = secs;
            }
            if host_address.is_some() {
                config.daemon.host_address = host_address;
            }
            config.validate()?;
            run(config).await
        }
        Command::Status { status_path, json } => {
            let path = status_path.unwrap_or(config.daemon.status_path);
            print_status(&path, json).await
        }
        Command::ResetRouting => {
            RoutingSwitch::new(Arc::new(IpRouteBackend::new(&config.routing)))
                .reset()
                .await?;
            info!("Policy routing removed");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        profile_dir = %config.catalog.profile_dir.display(),
        rotation_interval_secs = config.rotation.interval_secs,
        "Starting tunrot"
    );

    // A misordered classifier could put the operator session into the
    // tunnel: refuse to start.
    let session_address = session_address_from_env();
    if config.classifier.operator_address.is_none() && session_address.is_none() {
        warn!("No operator address configured or detected; protecting by port only");
    }
    // Tunnel processes and probes run as this uid and must stay unrotated.
    let transport_uid = nix::unistd::geteuid().as_raw();
    let classifier =
        TrafficClassifier::from_config(&config.classifier, session_address, transport_uid)
            .context("classifier policy rejected")?;

    let blacklist = Arc::new(BlacklistStore::new());
    let catalog = CandidateCatalog::load(
        &config.catalog,
        Arc::clone(&blacklist),
        policy_for(config.catalog.selection),
    )?;

    // The chain is installed before anything probes, so this process's own
    // traffic is already exempt from a previous run's rotated route.
    let routing = RoutingSwitch::new(Arc::new(IpRouteBackend::new(&config.routing)));
    routing.prepare(&classifier).await?;

    let probe: Arc<dyn EgressProbe> = Arc::new(HttpEgressProbe::new(
        config.health.probe_urls.clone(),
        config.health.probe_timeout(),
    ));
    let host_address = match config.daemon.host_address {
        Some(addr) => addr,
        None => detect_host_address(probe.as_ref(), config.health.probe_timeout()).await?,
    };
    info!(%host_address, "Host egress address");

    let transport: Arc<dyn TunnelTransport> = Arc::new(OpenVpnTransport::new(
        config.tunnel.binary.clone(),
        config.routing.ip_bin.clone(),
        config.tunnel.run_dir.clone(),
        config.tunnel.log_dir.clone(),
        config.tunnel.terminate_timeout(),
    ));
    let slots = SlotPair::new(&config.tunnel.interfaces, &transport, &probe);

    let scheduler = Arc::new(RotationScheduler::new(
        catalog,
        slots,
        routing,
        RotationSettings::from_config(&config, host_address),
    ));
    let previous = match status::read_snapshot(&config.daemon.status_path).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            debug!(error = %e, "No previous status to recover from");
            None
        }
    };
    if !scheduler.recover(previous.as_ref()).await {
        info!("No tunnel adopted; bootstrapping");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);

    let monitor = HealthMonitor::new(
        Arc::clone(&probe),
        Arc::clone(&blacklist),
        scheduler.subscribe(),
        requests_tx,
        HealthSettings {
            interval: config.health.interval(),
            probe_timeout: config.health.probe_timeout(),
            threshold: config.health.failure_threshold,
            blacklist_duration: config.blacklist.default_duration(),
            host_address,
        },
    );
    let backoff = Backoff::new(BackoffPolicy::from_config(
        &config.rotation.backoff,
        config.rotation.interval(),
    ));
    let control = ControlLoop::new(
        Arc::clone(&scheduler),
        requests_rx,
        config.rotation.interval(),
        backoff,
    )
    .with_health(monitor)
    .with_status_file(config.daemon.status_path.clone());
    let control_handle = tokio::spawn(control.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so tunnel processes don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = control_handle.await;

    info!("Daemon stopped; active tunnel left in place");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn print_status(path: &Path, json: bool) -> anyhow::Result<()> {
    let snapshot = status::read_snapshot(path)
        .await
        .context("is the daemon running?")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", status::render(&snapshot, unix_secs(SystemTime::now())));
    }
    Ok(())
}

/// Probe the default path for the host's own egress address. Runs as the
/// transport uid, which the classifier never rotates.
async fn detect_host_address(probe: &dyn EgressProbe, timeout: Duration) -> anyhow::Result<IpAddr> {
    let mut last_error = None;
    for attempt in 1..=HOST_PROBE_ATTEMPTS {
        match tokio::time::timeout(timeout, probe.egress_address(None)).await {
            Ok(Ok(addr)) => return Ok(addr),
            Ok(Err(e)) => last_error = Some(e.to_string()),
            Err(_) => last_error = Some(format!("timed out after {timeout:?}")),
        }
        warn!(attempt, error = ?last_error, "Host address detection failed");
    }
    anyhow::bail!(
        "cannot determine the host's egress address ({}); set daemon.host_address",
        last_error.unwrap_or_default()
    )
}
