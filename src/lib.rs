//! # ionos-ddns
//!
//! A Dynamic DNS updater for domains hosted on IONOS.
//!
//! ## Features
//!
//! - Public address detection over an ordered list of lookup services
//! - Per-record reconciliation with exponential backoff and failure thresholds
//! - Crash-safe state file so restarts don't re-send unchanged addresses
//! - Optional `/healthz` and `/status` endpoint
//!
//! ## Usage
//!
//! ```bash
//! # Show detected address and stored state
//! ionos-ddns status
//!
//! # Run one reconciliation cycle
//! ionos-ddns update
//!
//! # Run as daemon
//! ionos-ddns daemon
//! ```

pub mod backoff;
pub mod config;
pub mod detector;
pub mod error;
pub mod health;
pub mod providers;
pub mod reconciler;
pub mod record;
pub mod state;

pub use config::Config;
pub use detector::IpDetector;
pub use error::{DdnsError, Result, UpdateError};
pub use reconciler::{CycleKind, Reconciler};
