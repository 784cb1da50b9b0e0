//! Public IP detection.

use crate::error::{DdnsError, Result};
use crate::record::{RecordType, ResolvedAddress};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Determines the caller's current public address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve an address of the given family.
    async fn resolve(&self, family: RecordType) -> Result<ResolvedAddress>;
}

/// IP detector with multiple fallback services.
///
/// Services are tried in order; the first one returning a well-formed
/// address of the requested family wins.
pub struct IpDetector {
    client: reqwest::Client,
    services: Vec<String>,
}

impl IpDetector {
    /// Create a detector with a per-endpoint timeout.
    pub fn new(services: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ionos-ddns/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, services })
    }

    /// Try a single IP detection service.
    async fn try_service(&self, url: &str) -> Result<IpAddr> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(DdnsError::Resolution(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let text = response.text().await?;
        parse_address(&text)
            .ok_or_else(|| DdnsError::Resolution(format!("Invalid IP response: {}", text.trim())))
    }
}

#[async_trait]
impl AddressResolver for IpDetector {
    async fn resolve(&self, family: RecordType) -> Result<ResolvedAddress> {
        for service in &self.services {
            match self.try_service(service).await {
                Ok(ip) if family.matches(&ip) => {
                    tracing::debug!("Detected {} address {} from {}", family, ip, service);
                    return Ok(ResolvedAddress::new(ip, service.as_str()));
                }
                Ok(ip) => {
                    tracing::debug!("Service {} returned {} which is not {}", service, ip, family);
                }
                Err(e) => {
                    tracing::warn!("Service {} failed: {}", service, e);
                }
            }
        }

        Err(DdnsError::Resolution(format!(
            "All {} {} lookup services failed",
            self.services.len(),
            family
        )))
    }
}

/// Routes each family to its own list of lookup services.
pub struct DualStackResolver {
    ipv4: IpDetector,
    ipv6: IpDetector,
}

impl DualStackResolver {
    pub fn new(ipv4: IpDetector, ipv6: IpDetector) -> Self {
        Self { ipv4, ipv6 }
    }
}

#[async_trait]
impl AddressResolver for DualStackResolver {
    async fn resolve(&self, family: RecordType) -> Result<ResolvedAddress> {
        match family {
            RecordType::A => self.ipv4.resolve(family).await,
            RecordType::Aaaa => self.ipv6.resolve(family).await,
        }
    }
}

/// Extract an address from a plain-text or JSON lookup response.
pub fn parse_address(body: &str) -> Option<IpAddr> {
    let body = body.trim();

    if body.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        return ["ip", "address", "ip_addr", "query"]
            .iter()
            .filter_map(|key| value.get(*key)?.as_str())
            .find_map(|s| s.trim().parse().ok());
    }

    body.parse().ok()
}
