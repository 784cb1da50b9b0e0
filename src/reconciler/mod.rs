//! Reconciliation loop.
//!
//! Each full cycle resolves the public address (once per resolution group),
//! compares it with every record's last applied address and pushes updates
//! for diverged records concurrently. Transient failures move a record to
//! `Retrying`; the loop wakes early for due retries between full cycles.
//!
//! ```text
//!  Unknown ──┐
//!            ├─ address differs ─▶ Diverged ── ok ──────────▶ Synced
//!  Synced ───┘                        │
//!                                     ├─ transient ─▶ Retrying ─(threshold)─▶ Failed
//!                                     └─ auth / not found / rejected ───────▶ Failed
//! ```

mod status;


pub use status::{RecordStatus, RecordStatusView, StatusBoard};

use crate::backoff::Backoff;
use crate::config::{Config, ResolvePolicy};
use crate::detector::AddressResolver;
use crate::error::{Result, UpdateError};
use crate::providers::UpdateClient;
use crate::record::{ManagedRecord, RecordState, ResolvedAddress};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Loop tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_consecutive_failures: u32,
    pub backoff: Backoff,
    pub resolve_policy: ResolvePolicy,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.check_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            max_consecutive_failures: config.max_consecutive_failures,
            backoff: Backoff::from(&config.backoff),
            resolve_policy: config.resolve_policy,
        }
    }
}

/// Which records a cycle considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Every record, including failed ones.
    Full,
    /// Only `Retrying` records whose backoff has elapsed.
    Retry,
}

/// Outcome of one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// No address could be resolved; nothing was touched.
    pub skipped: bool,
    /// Records already pointing at the resolved address.
    pub unchanged: usize,
    /// Provider calls made.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Tracked {
    state: RecordState,
    status: RecordStatus,
    // Last save failed; write again next cycle.
    dirty: bool,
}

/// Drives every managed record towards the current public address.
pub struct Reconciler {
    resolver: Arc<dyn AddressResolver>,
    overrides: HashMap<String, Arc<dyn AddressResolver>>,
    client: Arc<dyn UpdateClient>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    records: Vec<Tracked>,
    board: StatusBoard,
    force_next: bool,
    successes_since_heartbeat: u64,
}

impl Reconciler {
    pub fn new(
        records: Vec<ManagedRecord>,
        resolver: Arc<dyn AddressResolver>,
        client: Arc<dyn UpdateClient>,
        store: Arc<dyn StateStore>,
        settings: Settings,
    ) -> Self {
        let records = records
            .into_iter()
            .map(|record| Tracked {
                state: RecordState::new(record),
                status: RecordStatus::Unknown,
                dirty: false,
            })
            .collect();

        Self {
            resolver,
            overrides: HashMap::new(),
            client,
            store,
            clock: Arc::new(SystemClock),
            settings,
            records,
            board: StatusBoard::new(),
            force_next: false,
            successes_since_heartbeat: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a dedicated resolver for the record with this key.
    pub fn with_resolver_override(
        mut self,
        key: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        self.overrides.insert(key.into(), resolver);
        self
    }

    /// Publish status into an externally owned board (e.g., the health server's).
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = board;
        self
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Ignore stored addresses on the next full cycle.
    pub fn force_next_cycle(&mut self) {
        self.force_next = true;
    }

    /// Merge persisted state into the configured records.
    ///
    /// Configuration stays authoritative for the record itself; only the
    /// applied address, its timestamp and the failure count are restored.
    pub async fn load_state(&mut self) -> Result<()> {
        let mut persisted = self.store.load().await?;

        for tracked in &mut self.records {
            if let Some(stored) = persisted.remove(&tracked.state.key()) {
                tracked.state.last_applied = stored.last_applied;
                tracked.state.last_applied_at = stored.last_applied_at;
                tracked.state.consecutive_failures = stored.consecutive_failures;
            }
        }

        if !persisted.is_empty() {
            debug!(
                "Ignoring persisted state for {} unconfigured record(s)",
                persisted.len()
            );
        }

        self.publish().await;
        Ok(())
    }

    pub fn states(&self) -> impl Iterator<Item = (&RecordState, &RecordStatus)> {
        self.records.iter().map(|t| (&t.state, &t.status))
    }

    pub fn status_of(&self, key: &str) -> Option<&RecordStatus> {
        self.records
            .iter()
            .find(|t| t.state.key() == key)
            .map(|t| &t.status)
    }

    /// Earliest scheduled retry, if any record is retrying.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.records
            .iter()
            .filter_map(|t| match t.status {
                RecordStatus::Retrying { next_attempt_at } => Some(next_attempt_at),
                _ => None,
            })
            .min()
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&mut self, kind: CycleKind) -> CycleReport {
        let mut report = CycleReport::default();
        let now = self.clock.now();

        self.flush_dirty().await;

        let candidates: Vec<usize> = (0..self.records.len())
            .filter(|&i| match (kind, &self.records[i].status) {
                (CycleKind::Full, _) => true,
                (CycleKind::Retry, RecordStatus::Retrying { next_attempt_at }) => {
                    *next_attempt_at <= now
                }
                (CycleKind::Retry, _) => false,
            })
            .collect();

        if candidates.is_empty() {
            return report;
        }

        let resolved = self.resolve_groups(&candidates).await;
        if resolved.values().all(Option::is_none) {
            error!("Address resolution failed for every record, skipping cycle");
            report.skipped = true;
            return report;
        }

        let force = kind == CycleKind::Full && std::mem::take(&mut self.force_next);
        let mut batch = Vec::new();

        for &i in &candidates {
            let Some(Some(address)) = resolved.get(&self.group_key(i)) else {
                continue;
            };

            let tracked = &mut self.records[i];
            let key = tracked.state.key();

            match &tracked.status {
                RecordStatus::Failed {
                    fatal: true,
                    address: failed_at,
                    ..
                } if *failed_at == address.value => {
                    debug!("{} stays failed until its address or configuration changes", key);
                    continue;
                }
                RecordStatus::Retrying { next_attempt_at } if *next_attempt_at > now => {
                    debug!("{} backing off until {}", key, next_attempt_at);
                    continue;
                }
                _ => {}
            }

            if !force && tracked.state.is_applied(&address.value) {
                report.unchanged += 1;
                if tracked.state.consecutive_failures > 0 {
                    tracked.state.consecutive_failures = 0;
                    tracked.dirty = true;
                }
                transition(tracked, RecordStatus::Synced);
                continue;
            }

            transition(tracked, RecordStatus::Diverged);
            batch.push((i, address.clone()));
        }

        // One task per record; a record appears at most once per batch and
        // cycles never overlap, so each record has at most one call in flight.
        let handles: Vec<_> = batch
            .into_iter()
            .map(|(i, address)| {
                let client = Arc::clone(&self.client);
                let record = self.records[i].state.record.clone();
                let task_address = address.clone();
                let handle = tokio::spawn(async move {
                    client.update_record(&record, &task_address).await
                });
                (i, address, handle)
            })
            .collect();

        for (i, address, handle) in handles {
            report.attempted += 1;
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(UpdateError::Transient(format!("update task aborted: {}", e))),
            };

            if result.is_ok() {
                report.succeeded += 1;
                self.successes_since_heartbeat += 1;
            } else {
                report.failed += 1;
            }

            self.apply_result(i, &address, result);
            self.persist(i).await;
        }

        self.flush_dirty().await;
        self.publish().await;
        report
    }

    fn apply_result(
        &mut self,
        i: usize,
        address: &ResolvedAddress,
        result: std::result::Result<(), UpdateError>,
    ) {
        let now = self.clock.now();
        let max_failures = self.settings.max_consecutive_failures;
        let tracked = &mut self.records[i];
        let key = tracked.state.key();

        match result {
            Ok(()) => {
                let previous = tracked.state.last_applied;
                tracked.state.confirm(address.value, now);
                info!(
                    "Updated {}: {} -> {} (via {})",
                    key,
                    previous.map(|ip| ip.to_string()).unwrap_or_else(|| "none".to_string()),
                    address.value,
                    address.source
                );
                transition(tracked, RecordStatus::Synced);
            }
            Err(err) if err.is_retryable() => {
                tracked.state.consecutive_failures += 1;
                let failures = tracked.state.consecutive_failures;

                if failures >= max_failures {
                    error!(
                        "{} failed {} consecutive times, giving up until next cycle: {}",
                        key, failures, err
                    );
                    transition(
                        tracked,
                        RecordStatus::Failed {
                            reason: err.to_string(),
                            fatal: false,
                            address: address.value,
                        },
                    );
                } else {
                    let delay = self.settings.backoff.delay(failures, err.retry_after());
                    let next_attempt_at = now + to_chrono(delay);
                    warn!(
                        "Update of {} failed (attempt {}), retrying in {}s: {}",
                        key,
                        failures,
                        delay.as_secs(),
                        err
                    );
                    transition(tracked, RecordStatus::Retrying { next_attempt_at });
                }
            }
            Err(err) => {
                tracked.state.consecutive_failures += 1;
                error!("Update of {} failed permanently, operator action required: {}", key, err);
                transition(
                    tracked,
                    RecordStatus::Failed {
                        reason: err.to_string(),
                        fatal: true,
                        address: address.value,
                    },
                );
            }
        }
    }

    async fn persist(&mut self, i: usize) {
        let tracked = &mut self.records[i];
        match self.store.save(&tracked.state).await {
            Ok(()) => tracked.dirty = false,
            Err(e) => {
                error!("Failed to persist state for {}: {}", tracked.state.key(), e);
                tracked.dirty = true;
            }
        }
    }

    async fn flush_dirty(&mut self) {
        for i in 0..self.records.len() {
            if self.records[i].dirty {
                self.persist(i).await;
            }
        }
    }

    fn group_key(&self, i: usize) -> String {
        let key = self.records[i].state.key();
        if self.overrides.contains_key(&key) || self.settings.resolve_policy == ResolvePolicy::PerRecord {
            format!("record:{}", key)
        } else {
            format!("family:{}", self.records[i].state.record.record_type)
        }
    }

    async fn resolve_groups(&self, candidates: &[usize]) -> HashMap<String, Option<ResolvedAddress>> {
        let mut resolved = HashMap::new();

        for &i in candidates {
            let group = self.group_key(i);
            if resolved.contains_key(&group) {
                continue;
            }

            let record = &self.records[i].state.record;
            let resolver = self.overrides.get(&record.key()).unwrap_or(&self.resolver);

            let address = match resolver.resolve(record.record_type).await {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Resolution for {} failed: {}", group, e);
                    None
                }
            };
            resolved.insert(group, address);
        }

        resolved
    }

    async fn publish(&self) {
        let views = self
            .records
            .iter()
            .map(|t| RecordStatusView::new(&t.state, &t.status))
            .collect();
        self.board.publish(views).await;
    }

    /// Which cycle comes next given the next scheduled full cycle, and when.
    ///
    /// A due retry earlier than `next_full` gets its own retry pass.
    pub fn next_cycle(&self, next_full: DateTime<Utc>) -> (CycleKind, DateTime<Utc>) {
        match self.next_retry_at() {
            Some(retry) if retry < next_full => (CycleKind::Retry, retry),
            _ => (CycleKind::Full, next_full),
        }
    }

    /// Log liveness and reset the success counter; returns the count logged.
    fn heartbeat(&mut self) -> u64 {
        let successes = std::mem::take(&mut self.successes_since_heartbeat);
        info!(
            "Heartbeat: service running, {} successful update(s) since last heartbeat",
            successes
        );
        successes
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    ///
    /// A full cycle runs immediately, then every `interval`. A cycle in
    /// progress always completes, so no provider call is cut off.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Reconciling {} record(s) every {}s",
            self.records.len(),
            self.settings.interval.as_secs()
        );

        let interval = to_chrono(self.settings.interval);
        let heartbeat = to_chrono(self.settings.heartbeat_interval);
        let mut next_full = self.clock.now();
        let mut next_heartbeat = next_full + heartbeat;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (kind, due) = self.next_cycle(next_full);
            let wake = due.min(next_heartbeat);
            let wait = (wake - self.clock.now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let now = self.clock.now();
            if now >= next_heartbeat {
                self.heartbeat();
                next_heartbeat = now + heartbeat;
            }
            if now < due {
                continue;
            }

            if kind == CycleKind::Full {
                next_full = (due + interval).max(now);
            }

            let report = self.run_cycle(kind).await;
            debug!("Cycle {:?} finished: {:?}", kind, report);
        }

        info!("Shutdown requested, reconciliation stopped");
        Ok(())
    }
}

fn transition(tracked: &mut Tracked, next: RecordStatus) {
    if tracked.status != next {
        debug!("{}: {} -> {}", tracked.state.key(), tracked.status, next);
        if tracked.status.label() != next.label() {
            info!("{} is now {}", tracked.state.key(), next);
        }
    }
    tracked.status = next;
}

fn to_chrono(d: Duration) -> chrono::Duration {
    // Out-of-range durations saturate at roughly a century.
    chrono::Duration::from_std(d.min(Duration::from_secs(100 * 365 * 86_400)))
        .unwrap_or_else(|_| chrono::Duration::days(100 * 365))
}
