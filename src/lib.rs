//! # SONiC Exporter - Snapshot-Cached Switch State Metrics
//!
//! Periodically extracts operational state from the SONiC key/value databases
//! (VLANs, link aggregates, forwarding tables, LLDP neighbours, containers) and
//! republishes it as an immutable, point-in-time metrics snapshot for
//! pull-based scraping.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             SONIC EXPORTER                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SOURCE STORE → PIPELINE (scan/join/bound) → SNAPSHOT CACHE → SINK/HTTP     │
//! │                      ▲                              ▲                       │
//! │                 SCHEDULER (interval | on-demand) ───┘                       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Snapshot cache**: one immutable snapshot per domain, swapped atomically.
//!   Readers never block and never observe a half-written snapshot.
//! - **Scheduler**: a cancellable background task per domain, or a lazy refresh
//!   on read guarded by a per-domain writer lock.
//! - **Pipelines**: per-domain scan, normalise, join and bound logic with
//!   double-entry skip accounting.
//! - **Exposition**: each domain describes its own descriptor table and drains
//!   its snapshot plus health into a caller-provided sink.

// ============================================================================
// SECTION 1: MODULE TREE
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod accounting;
pub mod cache;
pub mod collector;
pub mod config;
pub mod domains;
pub mod error;
pub mod exposition;
pub mod fields;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;

pub use accounting::{SkipLedger, StageTally};
pub use cache::{CyclePhase, HealthRecord, Snapshot, SnapshotCache};
pub use collector::{CollectorRegistry, DomainCollector, DomainEngine};
pub use config::{DomainConfig, ExporterConfig, RefreshMode};
pub use error::{ConfigError, ExporterError, ExporterResult, SkipReason, SourceError, SourceResult};
pub use exposition::{FamilySink, MetricSink, VecSink};
pub use store::{Database, FieldMap, MemoryStore, RedisStore, SourceStore};
pub use types::{Label, Labels, MetricDescriptor, MetricKind, MetricRecord, Timestamp};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version, taken from Cargo metadata.
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human readable product name.
pub const EXPORTER_FULL_NAME: &str = "SONiC Exporter";

/// Metric namespace shared by every domain.
pub const METRIC_NAMESPACE: &str = "sonic";

/// Default HTTP listen address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9101";

/// Default path serving the text exposition.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default source store address (the SONiC redis unix socket).
pub const DEFAULT_STORE_ADDRESS: &str = "unix:///var/run/redis/redis.sock";

/// Freshness window for on-demand domains.
pub const DEFAULT_FRESHNESS_SECS: u64 = 15;

/// Default SCAN batch size.
pub const DEFAULT_SCAN_COUNT: usize = 256;

/// Default per-cycle deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SONIC_EXPORTER_";

/// Label value used when a reference cannot be resolved.
pub const UNKNOWN_LABEL: &str = "unknown";
