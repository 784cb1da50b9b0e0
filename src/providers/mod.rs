//! DNS provider update client.

mod ionos;

#[cfg(test)]
mod tests;

pub use ionos::IonosClient;

use crate::error::UpdateError;
use crate::record::{ManagedRecord, ResolvedAddress};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

/// Pushes a resolved address to the provider for one record.
///
/// Implementations perform at most one write per call and never retry;
/// retry timing belongs to the reconciliation loop.
#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &'static str;

    /// Point `record` at `address`.
    async fn update_record(
        &self,
        record: &ManagedRecord,
        address: &ResolvedAddress,
    ) -> Result<(), UpdateError>;

    /// Check credentials and that `record` exists, without writing.
    async fn validate(&self, record: &ManagedRecord) -> Result<(), UpdateError>;
}

/// Map a non-success provider response onto the retry taxonomy.
///
/// Returns `None` for 2xx.
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> Option<UpdateError> {
    if status.is_success() {
        return None;
    }

    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), truncate(body.trim(), 200))
    };

    Some(match status.as_u16() {
        401 | 403 => UpdateError::Auth {
            status: status.as_u16(),
        },
        404 => UpdateError::NotFound(detail),
        429 => UpdateError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        500..=599 => UpdateError::Transient(detail),
        _ => UpdateError::Permanent(detail),
    })
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
