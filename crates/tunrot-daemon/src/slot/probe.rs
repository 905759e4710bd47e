//! Egress address probing.
//!
//! A probe asks an external "what is my IP" endpoint which public address
//! traffic leaving through a given interface appears to come from. A tunnel
//! only counts as carrying traffic when that address differs from the
//! host's own.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::error::ProbeError;

#[async_trait]
pub trait EgressProbe: Send + Sync {
    /// Public address seen for traffic leaving via `interface`, or via the
    /// host's default path when `None`.
    async fn egress_address(&self, interface: Option<&str>) -> Result<IpAddr, ProbeError>;
}

/// Probe one interface under a hard deadline and reject the host's own
/// address.
pub async fn check_egress(
    probe: &dyn EgressProbe,
    interface: &str,
    host_address: IpAddr,
    deadline: Duration,
) -> Result<IpAddr, ProbeError> {
    let observed = tokio::time::timeout(deadline, probe.egress_address(Some(interface)))
        .await
        .map_err(|_| ProbeError::Timeout(deadline))??;
    if observed == host_address {
        return Err(ProbeError::Mismatch(observed));
    }
    Ok(observed)
}

/// Plain HTTP(S) probe over a list of echo endpoints, tried in order.
#[derive(Debug, Clone)]
pub struct HttpEgressProbe {
    urls: Vec<String>,
    request_timeout: Duration,
}

impl HttpEgressProbe {
    pub fn new(urls: Vec<String>, request_timeout: Duration) -> Self {
        // Ignore the error if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            urls,
            request_timeout,
        }
    }

    fn client(&self, interface: Option<&str>) -> Result<reqwest::Client, ProbeError> {
        let builder = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .user_agent(concat!("tunrot/", env!("CARGO_PKG_VERSION")));
        bind_interface(builder, interface)
            .build()
            .map_err(|e| ProbeError::Unreachable(format!("client setup: {e}")))
    }
}

#[cfg(target_os = "linux")]
fn bind_interface(builder: reqwest::ClientBuilder, interface: Option<&str>) -> reqwest::ClientBuilder {
    match interface {
        Some(iface) => builder.interface(iface),
        None => builder,
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_interface(builder: reqwest::ClientBuilder, _interface: Option<&str>) -> reqwest::ClientBuilder {
    builder
}

#[async_trait]
impl EgressProbe for HttpEgressProbe {
    async fn egress_address(&self, interface: Option<&str>) -> Result<IpAddr, ProbeError> {
        let client = self.client(interface)?;
        let mut errors = Vec::new();
        for url in &self.urls {
            let result = async {
                let resp = client.get(url).send().await?.error_for_status()?;
                resp.text().await
            }
            .await;
            match result {
                Ok(body) => match parse_address(&body) {
                    Some(addr) => {
                        debug!(url, ?interface, %addr, "Egress probe answered");
                        return Ok(addr);
                    }
                    None => errors.push(format!("{url}: unparsable body")),
                },
                Err(e) => errors.push(format!("{url}: {e}")),
            }
        }
        Err(ProbeError::Unreachable(errors.join("; ")))
    }
}

/// Accept a bare address or a JSON object with an `ip` or `origin` field.
fn parse_address(body: &str) -> Option<IpAddr> {
    let body = body.trim();
    if let Ok(addr) = body.parse() {
        return Some(addr);
    }
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let field = value.get("ip").or_else(|| value.get("origin"))?.as_str()?;
    // httpbin reports "client, proxy" chains; the first hop is ours.
    field.split(',').next()?.trim().parse().ok()
}
