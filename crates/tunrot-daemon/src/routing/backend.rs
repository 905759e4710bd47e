//! Policy-routing commands (`ip`, `iptables`), invoked not reimplemented.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tunrot_core::TrafficClassifier;
use tunrot_core::config::RoutingConfig;

use super::RoutingError;

/// Host routing operations the switch performs.
#[async_trait]
pub trait PolicyRouter: Send + Sync {
    /// Install the fwmark rule, the rotated-table kill switch and the
    /// classifier chain hooked into mangle OUTPUT. Idempotent.
    async fn prepare(&self, classifier: &TrafficClassifier) -> Result<(), RoutingError>;

    /// Point the rotated table's default route at `interface` in one
    /// replace.
    async fn replace_default(&self, interface: &str) -> Result<(), RoutingError>;

    async fn flush_cache(&self) -> Result<(), RoutingError>;

    /// Remove the classifier chain and the fwmark rule.
    async fn reset(&self) -> Result<(), RoutingError>;
}

/// [`PolicyRouter`] over the `ip` and `iptables` binaries.
#[derive(Debug, Clone)]
pub struct IpRouteBackend {
    ip_bin: PathBuf,
    iptables_bin: PathBuf,
    table_id: u32,
    fwmark: u32,
    chain: String,
}

/// Metric of the table's fallback route. Any tunnel default route has a
/// lower metric and wins; with no tunnel, rotated packets are rejected
/// rather than falling through to the main table.
const KILL_SWITCH_METRIC: &str = "4096";

const MAX_STALE_RULES: usize = 16;

impl IpRouteBackend {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            ip_bin: config.ip_bin.clone(),
            iptables_bin: config.iptables_bin.clone(),
            table_id: config.table_id,
            fwmark: config.fwmark,
            chain: config.chain.clone(),
        }
    }

    fn table(&self) -> String {
        self.table_id.to_string()
    }

    fn fwmark_rule(&self, verb: &str) -> Vec<String> {
        vec![
            "rule".into(),
            verb.into(),
            "fwmark".into(),
            self.fwmark.to_string(),
            "table".into(),
            self.table(),
        ]
    }

    async fn ip(&self, description: &str, args: &[String]) -> Result<(), RoutingError> {
        run_cmd(description, &self.ip_bin, args).await
    }

    async fn iptables(&self, description: &str, args: &[String]) -> Result<(), RoutingError> {
        run_cmd(description, &self.iptables_bin, args).await
    }

    /// Delete every copy of the fwmark rule; `ip rule del` removes one per
    /// call and fails once none is left.
    async fn remove_fwmark_rules(&self) {
        for _ in 0..MAX_STALE_RULES {
            if self
                .ip("Removing fwmark rule", &self.fwmark_rule("del"))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    fn output_jump(&self, verb: &str) -> Vec<String> {
        ["-t", "mangle", verb, "OUTPUT", "-j", self.chain.as_str()]
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[async_trait]
impl PolicyRouter for IpRouteBackend {
    async fn prepare(&self, classifier: &TrafficClassifier) -> Result<(), RoutingError> {
        // `ip rule add` is not idempotent.
        self.remove_fwmark_rules().await;
        self.ip("Adding fwmark rule", &self.fwmark_rule("add")).await?;

        let kill_switch: Vec<String> = [
            "route", "replace", "unreachable", "default", "metric", KILL_SWITCH_METRIC, "table",
        ]
        .iter()
        .map(ToString::to_string)
        .chain([self.table()])
        .collect();
        self.ip("Installing rotated-table kill switch", &kill_switch).await?;

        let new_chain = strings(&["-t", "mangle", "-N", self.chain.as_str()]);
        // Fails when the chain already exists, which is fine.
        let _ = self.iptables("Creating classifier chain", &new_chain).await;
        self.iptables(
            "Flushing classifier chain",
            &strings(&["-t", "mangle", "-F", self.chain.as_str()]),
        )
        .await?;
        for rule in classifier.iptables_rules(&self.chain, self.fwmark) {
            self.iptables("Appending classifier rule", &rule).await?;
        }
        if self
            .iptables("Checking OUTPUT hook", &self.output_jump("-C"))
            .await
            .is_err()
        {
            let mut insert = self.output_jump("-I");
            insert.insert(4, "1".into());
            self.iptables("Hooking classifier chain into OUTPUT", &insert)
                .await?;
        }
        Ok(())
    }

    async fn replace_default(&self, interface: &str) -> Result<(), RoutingError> {
        let args = strings(&["route", "replace", "default", "dev", interface, "table"]);
        let args: Vec<String> = args.into_iter().chain([self.table()]).collect();
        self.ip("Switching rotated default route", &args).await
    }

    async fn flush_cache(&self) -> Result<(), RoutingError> {
        self.ip("Flushing route cache", &strings(&["route", "flush", "cache"]))
            .await
    }

    async fn reset(&self) -> Result<(), RoutingError> {
        let _ = self
            .iptables("Unhooking classifier chain", &self.output_jump("-D"))
            .await;
        let _ = self
            .iptables(
                "Flushing classifier chain",
                &strings(&["-t", "mangle", "-F", self.chain.as_str()]),
            )
            .await;
        let _ = self
            .iptables(
                "Deleting classifier chain",
                &strings(&["-t", "mangle", "-X", self.chain.as_str()]),
            )
            .await;
        self.remove_fwmark_rules().await;
        let table = self.table();
        self.ip(
            "Flushing rotated table",
            &strings(&["route", "flush", "table", table.as_str()]),
        )
        .await
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Execute a command with logging. Logs the full command line at debug level
/// and the description at info level.
async fn run_cmd(
    description: &str,
    program: &std::path::Path,
    args: &[String],
) -> Result<(), RoutingError> {
    let cmd_line = format!("{} {}", program.display(), args.join(" "));
    tracing::info!("{description}");
    tracing::debug!("exec: {cmd_line}");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| RoutingError::Spawn {
            command: cmd_line.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::debug!("command failed: {cmd_line}: {stderr}");
        return Err(RoutingError::Command {
            command: cmd_line,
            status: output.status.to_string(),
            stderr,
        });
    }
    Ok(())
}
