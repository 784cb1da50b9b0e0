//! IONOS DNS API client.

use super::{classify, UpdateClient};
use crate::error::{DdnsError, Result, UpdateError};
use crate::record::{ManagedRecord, ResolvedAddress};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.hosting.ionos.com/dns/v1";

/// IONOS DNS provider.
///
/// Zone and record identifiers not given in configuration are looked up on
/// first use and cached per record key.
pub struct IonosClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    ids: Mutex<HashMap<String, RecordIds>>,
}

impl std::fmt::Debug for IonosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IonosClient")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordIds {
    zone_id: String,
    record_id: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ZoneRecords {
    #[serde(default)]
    records: Vec<DnsRecord>,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Serialize)]
struct UpdateRequest {
    content: String,
    ttl: u32,
    prio: u16,
    disabled: bool,
}

impl IonosClient {
    /// Create a new IONOS client.
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string(), timeout)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        if api_key.is_empty() {
            return Err(DdnsError::Config("IONOS API key cannot be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ionos-ddns/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            ids: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> std::result::Result<T, UpdateError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header("X-API-Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if let Some(err) = classify(status, &headers, &body) {
            return Err(err);
        }

        serde_json::from_str(&body)
            .map_err(|e| UpdateError::Transient(format!("unexpected response from {}: {}", url, e)))
    }

    /// Find the zone whose name is the longest suffix of the record's domain.
    async fn find_zone_id(&self, domain: &str) -> std::result::Result<String, UpdateError> {
        let zones: Vec<Zone> = self.get_json(&format!("{}/zones", self.base_url), &[]).await?;
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        zones
            .into_iter()
            .filter(|z| {
                let name = z.name.to_ascii_lowercase();
                domain == name || domain.ends_with(&format!(".{}", name))
            })
            .max_by_key(|z| z.name.len())
            .map(|z| z.id)
            .ok_or_else(|| UpdateError::NotFound(format!("no zone contains {}", domain)))
    }

    async fn find_record_id(
        &self,
        zone_id: &str,
        record: &ManagedRecord,
    ) -> std::result::Result<String, UpdateError> {
        let url = format!("{}/zones/{}", self.base_url, zone_id);
        let zone: ZoneRecords = self
            .get_json(
                &url,
                &[
                    ("recordName", record.domain.as_str()),
                    ("recordType", record.record_type.as_str()),
                ],
            )
            .await?;

        zone.records
            .into_iter()
            .find(|r| {
                r.name.eq_ignore_ascii_case(record.domain.trim_end_matches('.'))
                    && r.record_type == record.record_type.as_str()
            })
            .map(|r| r.id)
            .ok_or_else(|| UpdateError::NotFound(format!("record {} does not exist", record)))
    }

    async fn record_ids(
        &self,
        record: &ManagedRecord,
    ) -> std::result::Result<RecordIds, UpdateError> {
        if let (Some(zone_id), Some(record_id)) = (&record.zone_id, &record.record_id) {
            return Ok(RecordIds {
                zone_id: zone_id.clone(),
                record_id: record_id.clone(),
            });
        }

        if let Some(ids) = self.cached(&record.key()) {
            return Ok(ids);
        }

        let zone_id = match &record.zone_id {
            Some(id) => id.clone(),
            None => self.find_zone_id(&record.domain).await?,
        };
        let record_id = self.find_record_id(&zone_id, record).await?;
        tracing::debug!("Resolved {} to zone {} record {}", record, zone_id, record_id);

        let ids = RecordIds { zone_id, record_id };
        self.lock_ids().insert(record.key(), ids.clone());
        Ok(ids)
    }

    fn cached(&self, key: &str) -> Option<RecordIds> {
        self.lock_ids().get(key).cloned()
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecordIds>> {
        // The map holds plain strings, so a poisoned lock is still consistent.
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UpdateClient for IonosClient {
    fn name(&self) -> &'static str {
        "ionos"
    }

    async fn update_record(
        &self,
        record: &ManagedRecord,
        address: &ResolvedAddress,
    ) -> std::result::Result<(), UpdateError> {
        if !record.record_type.matches(&address.value) {
            return Err(UpdateError::Permanent(format!(
                "{} cannot hold {}",
                record, address.value
            )));
        }

        let ids = self.record_ids(record).await?;
        let url = format!(
            "{}/zones/{}/records/{}",
            self.base_url, ids.zone_id, ids.record_id
        );

        let request = UpdateRequest {
            content: address.value.to_string(),
            ttl: record.ttl,
            prio: 0,
            disabled: false,
        };

        let response = self
            .client
            .put(&url)
            .header("X-API-Key", &self.api_key)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        match classify(status, &headers, &body) {
            None => {
                tracing::debug!("IONOS accepted {} -> {}", record, address.value);
                Ok(())
            }
            Some(err) => {
                if matches!(err, UpdateError::NotFound(_)) {
                    // Identifiers went stale; look them up again next time.
                    self.lock_ids().remove(&record.key());
                }
                Err(err)
            }
        }
    }

    async fn validate(&self, record: &ManagedRecord) -> std::result::Result<(), UpdateError> {
        let zone_id = match &record.zone_id {
            Some(id) => id.clone(),
            None => self.find_zone_id(&record.domain).await?,
        };
        self.find_record_id(&zone_id, record).await?;
        Ok(())
    }
}
