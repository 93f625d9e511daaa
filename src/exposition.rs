// ============================================================================
// SECTION 17: EXPOSITION
// ============================================================================
// Domain collectors push descriptors and records into a caller-provided
// sink. The HTTP surface uses `FamilySink`, which groups records into
// prometheus protobuf families for the text encoder.
// ============================================================================

use ahash::AHashMap;
use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};

use crate::error::{ExporterError, ExporterResult};
use crate::types::{MetricDescriptor, MetricKind, MetricRecord};

// ----------------------------------------------------------------------------
// 17.1 Sink Trait
// ----------------------------------------------------------------------------

/// Receiver of one collection pass.
pub trait MetricSink: Send {
    /// Announce a family, even if no record follows.
    fn describe(&mut self, descriptor: &MetricDescriptor);

    /// Deliver one record belonging to `descriptor`.
    fn record(&mut self, descriptor: &MetricDescriptor, record: &MetricRecord);
}

/// Collects everything as-is. Used by tests and the `snapshot` command.
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    pub descriptors: Vec<MetricDescriptor>,
    pub records: Vec<MetricRecord>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricRecord> + 'a {
        self.records.iter().filter(move |r| r.name == name)
    }

    /// Value of the first record named `name` carrying every given label.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.find(name)
            .find(|r| labels.iter().all(|(k, v)| r.label(k) == Some(*v)))
            .map(|r| r.value)
    }

    pub fn is_described(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }
}

impl MetricSink for VecSink {
    fn describe(&mut self, descriptor: &MetricDescriptor) {
        self.descriptors.push(descriptor.clone());
    }

    fn record(&mut self, _descriptor: &MetricDescriptor, record: &MetricRecord) {
        self.records.push(record.clone());
    }
}

// ----------------------------------------------------------------------------
// 17.2 Protobuf Families
// ----------------------------------------------------------------------------

/// Groups records into metric families in first-described order.
#[derive(Debug, Default)]
pub struct FamilySink {
    families: Vec<MetricFamily>,
    index: AHashMap<String, usize>,
}

impl FamilySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn family_for(&mut self, descriptor: &MetricDescriptor) -> &mut MetricFamily {
        let slot = match self.index.get(&descriptor.name) {
            Some(&slot) => slot,
            None => {
                let mut family = MetricFamily::default();
                family.set_name(descriptor.name.clone());
                family.set_help(descriptor.help.clone());
                family.set_field_type(match descriptor.kind {
                    MetricKind::Gauge => MetricType::GAUGE,
                    MetricKind::Counter => MetricType::COUNTER,
                });
                self.index.insert(descriptor.name.clone(), self.families.len());
                self.families.push(family);
                self.families.len() - 1
            }
        };
        &mut self.families[slot]
    }

    /// Families that received at least one record. The text encoder rejects
    /// empty families.
    pub fn finish(self) -> Vec<MetricFamily> {
        self.families
            .into_iter()
            .filter(|f| !f.get_metric().is_empty())
            .collect()
    }
}

impl MetricSink for FamilySink {
    fn describe(&mut self, descriptor: &MetricDescriptor) {
        self.family_for(descriptor);
    }

    fn record(&mut self, descriptor: &MetricDescriptor, record: &MetricRecord) {
        let mut metric = Metric::default();
        for label in &record.labels {
            let mut pair = LabelPair::default();
            pair.set_name(label.key.to_string());
            pair.set_value(label.value.to_string());
            metric.mut_label().push(pair);
        }
        match descriptor.kind {
            MetricKind::Gauge => {
                let mut gauge = Gauge::default();
                gauge.set_value(record.value);
                metric.set_gauge(gauge);
            }
            MetricKind::Counter => {
                let mut counter = Counter::default();
                counter.set_value(record.value);
                metric.set_counter(counter);
            }
        }
        self.family_for(descriptor).mut_metric().push(metric);
    }
}

/// Encode families in the Prometheus text format.
pub fn render_text(families: &[MetricFamily]) -> ExporterResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::with_capacity(families.len() * 256);
    encoder
        .encode(families, &mut buffer)
        .map_err(|e| ExporterError::Exposition(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| ExporterError::Exposition(e.to_string()))
}
