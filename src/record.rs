//! Managed records and their persisted reconciliation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// DNS record type under management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl RecordType {
    /// Whether `ip` belongs to this record's address family.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            RecordType::A => ip.is_ipv4(),
            RecordType::Aaaa => ip.is_ipv6(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DNS name/type pair kept pointed at the current public address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedRecord {
    /// Fully qualified record name (e.g., "home.example.com").
    pub domain: String,

    /// A or AAAA.
    #[serde(rename = "type", default = "default_record_type")]
    pub record_type: RecordType,

    /// Desired TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// IONOS zone identifier, looked up when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,

    /// IONOS record identifier, looked up when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Address-lookup endpoints used for this record instead of the global list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_services: Option<Vec<String>>,
}

fn default_record_type() -> RecordType {
    RecordType::A
}

pub(crate) fn default_ttl() -> u32 {
    60
}

impl ManagedRecord {
    /// Create an A/AAAA record with default TTL and lazily resolved identifiers.
    pub fn new(domain: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            domain: domain.into(),
            record_type,
            ttl: default_ttl(),
            zone_id: None,
            record_id: None,
            ip_services: None,
        }
    }

    /// Key used for state persistence: `domain/TYPE`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.domain.to_ascii_lowercase(), self.record_type)
    }
}

impl fmt::Display for ManagedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.domain, self.record_type)
    }
}

/// A public address observed during one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub value: IpAddr,
    pub resolved_at: DateTime<Utc>,
    /// Lookup endpoint that produced the address.
    pub source: String,
}

impl ResolvedAddress {
    pub fn new(value: IpAddr, source: impl Into<String>) -> Self {
        Self {
            value,
            resolved_at: Utc::now(),
            source: source.into(),
        }
    }
}

/// Persisted reconciliation state for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    pub record: ManagedRecord,

    /// Address last confirmed by the provider.
    #[serde(default)]
    pub last_applied: Option<IpAddr>,

    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub consecutive_failures: u32,
}

impl RecordState {
    /// State for a record that has never been applied.
    pub fn new(record: ManagedRecord) -> Self {
        Self {
            record,
            last_applied: None,
            last_applied_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn key(&self) -> String {
        self.record.key()
    }

    /// True when the provider already holds `address` for this record.
    pub fn is_applied(&self, address: &IpAddr) -> bool {
        self.last_applied.as_ref() == Some(address)
    }

    /// Commit a provider-confirmed update.
    pub fn confirm(&mut self, address: IpAddr, at: DateTime<Utc>) {
        self.last_applied = Some(address);
        self.last_applied_at = Some(at);
        self.consecutive_failures = 0;
    }
}
