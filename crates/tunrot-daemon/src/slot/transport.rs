//! Tunnel transport process control.
//!
//! The transport (OpenVPN) is invoked and observed, never reimplemented. It
//! runs daemonized with a pid file per interface, so a tunnel outlives a
//! restart of this process and the active path fails static.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::catalog::Candidate;

use super::error::TransportError;

/// How often a stopping process is polled for exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Handle to a launched tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub interface: String,
    pub pid_file: PathBuf,
}

/// Process-control primitives the slots consume.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Start a tunnel for `candidate` bound to `interface`.
    async fn launch(
        &self,
        candidate: &Candidate,
        interface: &str,
    ) -> Result<TransportHandle, TransportError>;

    /// Stop the tunnel. `hard` skips the graceful SIGTERM window.
    async fn stop(&self, handle: &TransportHandle, hard: bool) -> Result<(), TransportError>;

    /// IPv4 address assigned to `interface`, or `None` while it is down.
    async fn interface_address(&self, interface: &str) -> Result<Option<IpAddr>, TransportError>;

    /// Handle to a tunnel a previous run left running on `interface`.
    async fn adopt(&self, interface: &str) -> Result<Option<TransportHandle>, TransportError>;

    /// Stop whatever a previous run left on `interface`.
    async fn clear_stale(&self, interface: &str) -> Result<(), TransportError>;
}

/// OpenVPN transport.
#[derive(Debug, Clone)]
pub struct OpenVpnTransport {
    binary: PathBuf,
    ip_bin: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    terminate_timeout: Duration,
}

impl OpenVpnTransport {
    pub fn new(
        binary: PathBuf,
        ip_bin: PathBuf,
        run_dir: PathBuf,
        log_dir: PathBuf,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            ip_bin,
            run_dir,
            log_dir,
            terminate_timeout,
        }
    }

    fn pid_file(&self, interface: &str) -> PathBuf {
        self.run_dir.join(format!("{interface}.pid"))
    }

    fn args(&self, candidate: &Candidate, interface: &str) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            candidate.profile.display().to_string(),
            "--dev".to_string(),
            interface.to_string(),
            "--dev-type".to_string(),
            "tun".to_string(),
            "--daemon".to_string(),
            format!("tunrot-{interface}"),
            "--writepid".to_string(),
            self.pid_file(interface).display().to_string(),
            "--log-append".to_string(),
            self.log_dir.join(format!("{interface}.log")).display().to_string(),
            // Routes belong to the routing switch; the transport must never
            // touch the main table.
            "--route-noexec".to_string(),
        ];
        if let Some(dir) = candidate.profile.parent().filter(|p| !p.as_os_str().is_empty()) {
            args.push("--cd".to_string());
            args.push(dir.display().to_string());
        }
        if let Some(creds) = &candidate.credentials {
            args.push("--auth-user-pass".to_string());
            args.push(creds.display().to_string());
        }
        args
    }

    async fn stop_pid_file(&self, pid_file: &Path, hard: bool) -> Result<(), TransportError> {
        let contents = match tokio::fs::read_to_string(pid_file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Ok(raw) = contents.trim().parse::<i32>() else {
            warn!(pid_file = %pid_file.display(), "Ignoring unparsable pid file");
            remove_quietly(pid_file).await;
            return Ok(());
        };
        let pid = Pid::from_raw(raw);

        if !hard {
            send(pid, Signal::SIGTERM)?;
            let deadline = tokio::time::Instant::now() + self.terminate_timeout;
            while tokio::time::Instant::now() < deadline {
                if !is_alive(pid) {
                    info!(pid = raw, "Tunnel process exited gracefully");
                    remove_quietly(pid_file).await;
                    return Ok(());
                }
                tokio::time::sleep(EXIT_POLL).await;
            }
            warn!(pid = raw, "Timeout waiting for graceful shutdown, killing");
        }

        send(pid, Signal::SIGKILL)?;
        remove_quietly(pid_file).await;
        Ok(())
    }
}

#[async_trait]
impl TunnelTransport for OpenVpnTransport {
    async fn launch(
        &self,
        candidate: &Candidate,
        interface: &str,
    ) -> Result<TransportHandle, TransportError> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let pid_file = self.pid_file(interface);
        self.stop_pid_file(&pid_file, true).await?;

        let args = self.args(candidate, interface);
        info!(
            candidate = %candidate.id,
            interface,
            profile = %candidate.profile.display(),
            "Launching tunnel transport"
        );
        debug!(binary = %self.binary.display(), ?args, "exec");

        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::BinaryNotFound(self.binary.display().to_string())
                } else {
                    TransportError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(TransportError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(TransportHandle {
            interface: interface.to_string(),
            pid_file,
        })
    }

    async fn stop(&self, handle: &TransportHandle, hard: bool) -> Result<(), TransportError> {
        debug!(interface = %handle.interface, hard, "Stopping tunnel transport");
        self.stop_pid_file(&handle.pid_file, hard).await
    }

    async fn interface_address(&self, interface: &str) -> Result<Option<IpAddr>, TransportError> {
        let output = Command::new(&self.ip_bin)
            .args(["-o", "-4", "addr", "show", "dev", interface])
            .output()
            .await?;
        if !output.status.success() {
            // Device does not exist (yet).
            return Ok(None);
        }
        Ok(parse_inet(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn adopt(&self, interface: &str) -> Result<Option<TransportHandle>, TransportError> {
        let pid_file = self.pid_file(interface);
        let contents = match tokio::fs::read_to_string(&pid_file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let alive = contents
            .trim()
            .parse::<i32>()
            .is_ok_and(|raw| is_alive(Pid::from_raw(raw)));
        Ok(alive.then(|| TransportHandle {
            interface: interface.to_string(),
            pid_file,
        }))
    }

    async fn clear_stale(&self, interface: &str) -> Result<(), TransportError> {
        self.stop_pid_file(&self.pid_file(interface), true).await
    }
}

fn send(pid: Pid, sig: Signal) -> Result<(), TransportError> {
    match signal::kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(TransportError::Signal {
            pid: pid.as_raw(),
            reason: e.to_string(),
        }),
    }
}

fn is_alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove pid file");
    }
}

/// Extract the address from `ip -o -4 addr show` output
/// (`4: tun0    inet 10.8.0.2/24 scope global tun0 ...`).
fn parse_inet(output: &str) -> Option<IpAddr> {
    let mut words = output.split_whitespace();
    words.find(|w| *w == "inet")?;
    let cidr = words.next()?;
    cidr.split('/').next()?.parse().ok()
}
