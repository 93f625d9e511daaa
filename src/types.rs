// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data types every domain speaks:
// - Timestamps for snapshot and source ages
// - Labels stored inline for the common small case
// - Descriptors owned per domain engine, records produced from them
// ============================================================================

use std::fmt::{self, Display, Formatter, Write as _};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

use crate::UNKNOWN_LABEL;

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Seconds since epoch with sub-second precision
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Duration between two timestamps, clamped at zero
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Labels - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single label (key-value pair) for a metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: CompactString,
    pub value: CompactString,
}

impl Label {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.key, self.value.as_str())
    }
}

/// Ordered label set. The largest domain (LLDP) carries nine labels, so
/// everything else stays on the stack.
pub type Labels = SmallVec<[Label; 8]>;

// ----------------------------------------------------------------------------
// 3.3 Metric Kinds, Descriptors and Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

/// Static description of one metric family: fully qualified name, help text,
/// label names and kind. Owned by the domain engine that emits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub label_names: Vec<&'static str>,
    pub kind: MetricKind,
}

impl MetricDescriptor {
    pub fn new(
        namespace: &str,
        subsystem: &str,
        name: &str,
        help: impl Into<String>,
        label_names: &[&'static str],
        kind: MetricKind,
    ) -> Self {
        Self {
            name: fq_name(namespace, subsystem, name),
            help: help.into(),
            label_names: label_names.to_vec(),
            kind,
        }
    }

    pub fn gauge(
        namespace: &str,
        subsystem: &str,
        name: &str,
        help: impl Into<String>,
        label_names: &[&'static str],
    ) -> Self {
        Self::new(namespace, subsystem, name, help, label_names, MetricKind::Gauge)
    }

    pub fn counter(
        namespace: &str,
        subsystem: &str,
        name: &str,
        help: impl Into<String>,
        label_names: &[&'static str],
    ) -> Self {
        Self::new(namespace, subsystem, name, help, label_names, MetricKind::Counter)
    }

    /// Build a record, pairing label names with `values` positionally.
    ///
    /// The record always carries every label of the descriptor: missing
    /// values become `unknown` and surplus values are dropped.
    pub fn sample(&self, value: f64, values: &[&str]) -> MetricRecord {
        if self.label_names.len() != values.len() {
            warn!(
                target: "sonic::types",
                metric = %self.name,
                expected = self.label_names.len(),
                got = values.len(),
                "Label arity mismatch"
            );
        }
        let labels: Labels = self
            .label_names
            .iter()
            .enumerate()
            .map(|(i, k)| Label::new(*k, values.get(i).copied().unwrap_or(UNKNOWN_LABEL)))
            .collect();
        MetricRecord {
            name: CompactString::new(&self.name),
            labels,
            value,
            kind: self.kind,
        }
    }
}

/// `<namespace>_<subsystem>_<name>`, skipping empty parts.
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// One sample in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: CompactString,
    pub labels: Labels,
    pub value: f64,
    pub kind: MetricKind,
}

impl MetricRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    /// Render as a single exposition-style line; used for fingerprints and logs.
    pub fn render(&self, out: &mut String) {
        out.push_str(&self.name);
        if !self.labels.is_empty() {
            out.push('{');
            for (i, label) in self.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", label);
            }
            out.push('}');
        }
        let _ = writeln!(out, " {}", self.value);
    }
}

// ----------------------------------------------------------------------------
// 3.4 Descriptor Table
// ----------------------------------------------------------------------------

/// Ordered set of descriptors owned by one domain engine.
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    descriptors: Vec<MetricDescriptor>,
    index: AHashMap<String, usize>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. A second descriptor with the same name is ignored.
    pub fn push(&mut self, descriptor: MetricDescriptor) {
        if self.index.contains_key(&descriptor.name) {
            return;
        }
        self.index.insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
    }

    pub fn extend<I: IntoIterator<Item = MetricDescriptor>>(&mut self, iter: I) {
        for descriptor in iter {
            self.push(descriptor);
        }
    }

    pub fn get(&self, name: &str) -> Option<&MetricDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn as_slice(&self) -> &[MetricDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
