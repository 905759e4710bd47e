//! In-memory fakes for the transport, egress probe and policy router.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tunrot_core::TrafficClassifier;
use tunrot_daemon::blacklist::BlacklistStore;
use tunrot_daemon::catalog::{Candidate, CandidateCatalog, CandidateId, RoundRobin};
use tunrot_daemon::health::{HealthMonitor, HealthSettings};
use tunrot_daemon::routing::{PolicyRouter, RoutingError, RoutingSwitch};
use tunrot_daemon::scheduler::{RotationScheduler, RotationSettings, RotationTrigger};
use tunrot_daemon::slot::{
    EgressProbe, ProbeError, SlotPair, TransportError, TransportHandle, TunnelTransport,
};

pub const HOST: &str = "198.51.100.10";
pub const INTERFACES: [&str; 2] = ["tun0", "tun1"];
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(45);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);
pub const HOUR: Duration = Duration::from_secs(60 * 60);

/// How a candidate's tunnel behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Healthy,
    /// The transport refuses to start.
    LaunchFails,
    /// Comes up but traffic still leaves with the host's address.
    Leaks,
    /// Comes up but probes never get an answer.
    Unreachable,
}

/// Shared state of the simulated host.
#[derive(Debug, Default)]
pub struct World {
    behaviour: Mutex<HashMap<CandidateId, Behaviour>>,
    /// Interface -> candidate whose tunnel is running on it.
    running: Mutex<HashMap<String, CandidateId>>,
    pub launches: Mutex<Vec<CandidateId>>,
    /// (interface, hard)
    pub stops: Mutex<Vec<(String, bool)>>,
    /// Interfaces the router cut over to.
    pub cutovers: Mutex<Vec<String>>,
    /// Cutovers to an interface whose tunnel was not carrying traffic.
    pub violations: Mutex<Vec<String>>,
    pub fail_routing: Mutex<bool>,
    pub route: Mutex<Option<String>>,
    pub resets: Mutex<u32>,
    /// How long a launched transport takes to finish starting.
    pub launch_delay: Mutex<Duration>,
    /// How long the route cache flush after a replace takes.
    pub flush_delay: Mutex<Duration>,
}

impl World {
    pub fn set(&self, candidate: &str, behaviour: Behaviour) {
        self.behaviour
            .lock()
            .unwrap()
            .insert(CandidateId::new(candidate), behaviour);
    }

    pub fn behaviour(&self, candidate: &CandidateId) -> Behaviour {
        self.behaviour
            .lock()
            .unwrap()
            .get(candidate)
            .copied()
            .unwrap_or(Behaviour::Healthy)
    }

    pub fn running_on(&self, interface: &str) -> Option<CandidateId> {
        self.running.lock().unwrap().get(interface).cloned()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn cutover_count(&self) -> usize {
        self.cutovers.lock().unwrap().len()
    }

    pub fn route(&self) -> Option<String> {
        self.route.lock().unwrap().clone()
    }

    /// Egress address a healthy candidate's tunnel presents.
    pub fn egress_of(candidate: &CandidateId) -> IpAddr {
        let n = candidate
            .as_str()
            .bytes()
            .fold(0u8, |acc, b| acc.wrapping_add(b))
            .max(1);
        IpAddr::from([185, 65, 134, n])
    }
}

pub struct FakeTransport(pub Arc<World>);

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn launch(
        &self,
        candidate: &Candidate,
        interface: &str,
    ) -> Result<TransportHandle, TransportError> {
        self.0.launches.lock().unwrap().push(candidate.id.clone());
        if self.0.behaviour(&candidate.id) == Behaviour::LaunchFails {
            return Err(TransportError::Exited {
                status: "exit status: 1".into(),
                stderr: "Options error: cannot open profile".into(),
            });
        }
        self.0
            .running
            .lock()
            .unwrap()
            .insert(interface.to_string(), candidate.id.clone());
        let delay = *self.0.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(TransportHandle {
            interface: interface.to_string(),
            pid_file: PathBuf::from(format!("/run/tunrot/{interface}.pid")),
        })
    }

    async fn stop(&self, handle: &TransportHandle, hard: bool) -> Result<(), TransportError> {
        self.0.running.lock().unwrap().remove(&handle.interface);
        self.0
            .stops
            .lock()
            .unwrap()
            .push((handle.interface.clone(), hard));
        Ok(())
    }

    async fn interface_address(&self, interface: &str) -> Result<Option<IpAddr>, TransportError> {
        Ok(self
            .0
            .running_on(interface)
            .map(|_| IpAddr::from([10, 8, 0, 2])))
    }

    async fn adopt(&self, interface: &str) -> Result<Option<TransportHandle>, TransportError> {
        Ok(self.0.running_on(interface).map(|_| TransportHandle {
            interface: interface.to_string(),
            pid_file: PathBuf::from(format!("/run/tunrot/{interface}.pid")),
        }))
    }

    async fn clear_stale(&self, interface: &str) -> Result<(), TransportError> {
        self.0.running.lock().unwrap().remove(interface);
        Ok(())
    }
}

pub struct FakeProbe(pub Arc<World>);

#[async_trait]
impl EgressProbe for FakeProbe {
    async fn egress_address(&self, interface: Option<&str>) -> Result<IpAddr, ProbeError> {
        let Some(interface) = interface else {
            return Ok(HOST.parse().unwrap());
        };
        let Some(candidate) = self.0.running_on(interface) else {
            return Err(ProbeError::Unreachable(format!("{interface}: no such device")));
        };
        match self.0.behaviour(&candidate) {
            Behaviour::Healthy => Ok(World::egress_of(&candidate)),
            Behaviour::Leaks => Ok(HOST.parse().unwrap()),
            Behaviour::Unreachable | Behaviour::LaunchFails => {
                Err(ProbeError::Unreachable("connection timed out".into()))
            }
        }
    }
}

pub struct FakeRouter(pub Arc<World>);

#[async_trait]
impl PolicyRouter for FakeRouter {
    async fn prepare(&self, _classifier: &TrafficClassifier) -> Result<(), RoutingError> {
        Ok(())
    }

    async fn replace_default(&self, interface: &str) -> Result<(), RoutingError> {
        if *self.0.fail_routing.lock().unwrap() {
            return Err(RoutingError::Command {
                command: format!("ip route replace default dev {interface} table 100"),
                status: "exit status: 2".into(),
                stderr: "RTNETLINK answers: Network is down".into(),
            });
        }
        let carrying = self
            .0
            .running_on(interface)
            .is_some_and(|c| self.0.behaviour(&c) == Behaviour::Healthy);
        if !carrying {
            self.0.violations.lock().unwrap().push(interface.to_string());
        }
        self.0.cutovers.lock().unwrap().push(interface.to_string());
        *self.0.route.lock().unwrap() = Some(interface.to_string());
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), RoutingError> {
        let delay = *self.0.flush_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), RoutingError> {
        *self.0.resets.lock().unwrap() += 1;
        *self.0.route.lock().unwrap() = None;
        Ok(())
    }
}

pub fn settings() -> RotationSettings {
    RotationSettings {
        max_attempts: 3,
        verify_timeout: VERIFY_TIMEOUT,
        drain_grace: DRAIN_GRACE,
        launch_failure_blacklist: HOUR,
        failure_blacklist: DAY,
        host_address: HOST.parse().unwrap(),
    }
}

pub struct Harness {
    pub world: Arc<World>,
    pub scheduler: Arc<RotationScheduler>,
    pub blacklist: Arc<BlacklistStore>,
    pub probe: Arc<dyn EgressProbe>,
}

impl Harness {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_settings(ids, settings())
    }

    pub fn with_settings(ids: &[&str], settings: RotationSettings) -> Self {
        Self::on_world(Arc::new(World::default()), ids, settings)
    }

    /// A fresh daemon over an existing host, as after a restart.
    pub fn on_world(world: Arc<World>, ids: &[&str], settings: RotationSettings) -> Self {
        let blacklist = Arc::new(BlacklistStore::new());
        let candidates = ids
            .iter()
            .map(|id| {
                Candidate::new(
                    *id,
                    *id,
                    PathBuf::from(format!("/etc/openvpn/mullvad_{id}_all.conf")),
                )
            })
            .collect();
        let catalog = CandidateCatalog::new(
            candidates,
            Arc::clone(&blacklist),
            Box::new(RoundRobin::default()),
        );
        let transport: Arc<dyn TunnelTransport> = Arc::new(FakeTransport(Arc::clone(&world)));
        let probe: Arc<dyn EgressProbe> = Arc::new(FakeProbe(Arc::clone(&world)));
        let interfaces = INTERFACES.map(String::from);
        let slots = SlotPair::new(&interfaces, &transport, &probe);
        let routing = RoutingSwitch::new(Arc::new(FakeRouter(Arc::clone(&world))));
        let scheduler = Arc::new(RotationScheduler::new(catalog, slots, routing, settings));
        Self {
            world,
            scheduler,
            blacklist,
            probe,
        }
    }

    pub fn health_monitor(&self, requests: mpsc::Sender<RotationTrigger>) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.probe),
            Arc::clone(&self.blacklist),
            self.scheduler.subscribe(),
            requests,
            HealthSettings {
                interval: Duration::from_secs(300),
                probe_timeout: Duration::from_secs(15),
                threshold: 3,
                blacklist_duration: DAY,
                host_address: HOST.parse().unwrap(),
            },
        )
    }

    pub fn active_candidate(&self) -> Option<String> {
        self.scheduler
            .status()
            .active_candidate
            .map(|c| c.as_str().to_string())
    }

    /// Invariants that must hold whenever no rotation is running.
    pub fn assert_consistent(&self) {
        let status = self.scheduler.status();
        let active: Vec<_> = status
            .slots
            .iter()
            .filter(|s| s.state == tunrot_daemon::slot::SlotState::Active)
            .collect();
        assert!(active.len() <= 1, "more than one Active slot: {status:?}");
        assert_eq!(
            active.first().map(|s| s.interface.clone()),
            status.active_interface,
            "route does not point at the Active slot"
        );
        assert_eq!(
            *self.world.route.lock().unwrap(),
            status.active_interface,
            "host route disagrees with routing state"
        );
        assert!(
            self.world.violations.lock().unwrap().is_empty(),
            "cutover to an unverified interface"
        );
    }
}
