//! Routing switch: which tunnel interface the rotated table points at.
//!
//! Only the rotated table is ever written. The main table carries the
//! protected path and is never touched, so a failure here can never cut the
//! operator off.

pub mod backend;

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tunrot_core::TrafficClassifier;

pub use backend::{IpRouteBackend, PolicyRouter};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Which interface rotated traffic currently leaves through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    pub active_interface: Option<String>,
    /// Unix seconds of the last cutover.
    pub active_since: Option<u64>,
}

/// Sole writer of [`RoutingState`]. Lives inside the locked rotation core,
/// so cutovers are serialized with every other mutation.
pub struct RoutingSwitch {
    router: Arc<dyn PolicyRouter>,
    state: RoutingState,
}

impl std::fmt::Debug for RoutingSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSwitch")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RoutingSwitch {
    pub fn new(router: Arc<dyn PolicyRouter>) -> Self {
        Self {
            router,
            state: RoutingState::default(),
        }
    }

    pub const fn state(&self) -> &RoutingState {
        &self.state
    }

    /// Install the table binding and classifier rules. Run once at startup.
    pub async fn prepare(&self, classifier: &TrafficClassifier) -> Result<(), RoutingError> {
        self.router.prepare(classifier).await?;
        info!(rules = classifier.rules().len(), "Policy routing prepared");
        Ok(())
    }

    /// Repoint rotated traffic at `new_interface`.
    ///
    /// The route replace is the commit point: if it fails, the state and the
    /// previous route are unchanged. A failed cache flush after it is only
    /// logged, since the new route is already in place.
    pub async fn cutover(&mut self, new_interface: &str, now: SystemTime) -> Result<(), RoutingError> {
        self.router.replace_default(new_interface).await?;
        let previous = self.state.active_interface.replace(new_interface.to_string());
        self.state.active_since = Some(crate::blacklist::unix_secs(now));
        info!(from = ?previous, to = new_interface, "Rotated default route switched");

        if let Err(e) = self.router.flush_cache().await {
            warn!(error = %e, "Route cache flush failed after cutover");
        }
        Ok(())
    }

    /// Remove the classifier chain and fwmark rule. Operator cleanup only.
    pub async fn reset(&mut self) -> Result<(), RoutingError> {
        self.router.reset().await?;
        self.state = RoutingState::default();
        Ok(())
    }
}
