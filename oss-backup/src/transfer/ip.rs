//! Best-effort public IP discovery.
//!
//! Lookup never fails: an unavailable address is reported as an advisory
//! message and the caller builds a key without the IP segment.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Plain-text echo services, tried in order.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpLookup {
    pub ip: Option<IpAddr>,

    /// Why `ip` is missing
    pub advisory: Option<String>,
}

impl IpLookup {
    pub fn found(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            advisory: None,
        }
    }

    pub fn unavailable(advisory: impl Into<String>) -> Self {
        Self {
            ip: None,
            advisory: Some(advisory.into()),
        }
    }

    /// Key segment for the address, if any
    pub fn segment(&self) -> Option<String> {
        self.ip.map(|ip| ip.to_string())
    }
}

#[async_trait]
pub trait IpResolver: Send + Sync {
    async fn resolve(&self) -> IpLookup;
}

pub struct HttpIpResolver {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpIpResolver {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        Self::with_endpoints(DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(), timeout)
    }

    pub fn with_endpoints(endpoints: Vec<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, endpoints })
    }

    async fn query(&self, endpoint: &str) -> Result<IpAddr, String> {
        match self.client.get(endpoint).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.map_err(|e| e.to_string())?;
                body.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| format!("unexpected response body {:?}", body.trim()))
            }
            Ok(resp) => Err(format!("status {}", resp.status())),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl IpResolver for HttpIpResolver {
    async fn resolve(&self) -> IpLookup {
        let mut failures = Vec::new();

        for endpoint in &self.endpoints {
            match self.query(endpoint).await {
                Ok(ip) => {
                    debug!(endpoint = %endpoint, ip = %ip, "Resolved public IP");
                    return IpLookup::found(ip);
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Public IP lookup failed");
                    failures.push(format!("{}: {}", endpoint, e));
                }
            }
        }

        if failures.is_empty() {
            IpLookup::unavailable("no public IP endpoints configured")
        } else {
            IpLookup::unavailable(format!("public IP lookup failed ({})", failures.join("; ")))
        }
    }
}
