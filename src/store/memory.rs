//! In-process store backed by ordered maps, loadable from JSON database dumps.
//!
//! Dumps use the `{"id": "CONFIG_DB", "data": {"<key>": {"<field>": "<value>"}}}`
//! layout, one document per database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::{check_deadline, Database, FieldMap, SourceStore};
use crate::error::{ConfigError, ExporterError, ExporterResult, SourceError, SourceResult};

/// One database dump.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureDocument {
    pub id: String,
    #[serde(default)]
    pub data: BTreeMap<String, FieldMap>,
}

/// Ordered in-memory copy of the switch databases.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<Database, BTreeMap<String, FieldMap>>>,
    latency: RwLock<Option<Duration>>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of one hash.
    pub fn with_hash<I, K, V>(self, db: Database, key: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(db, key, fields);
        self
    }

    pub fn insert<I, K, V>(&self, db: Database, key: &str, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields: FieldMap = fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.tables
            .write()
            .entry(db)
            .or_default()
            .insert(key.to_string(), fields);
    }

    pub fn remove(&self, db: Database, key: &str) {
        if let Some(table) = self.tables.write().get_mut(&db) {
            table.remove(key);
        }
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// Delay every call by `latency` (still bounded by the caller's deadline).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Make every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of store calls served so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn key_count(&self, db: Database) -> usize {
        self.tables.read().get(&db).map(BTreeMap::len).unwrap_or(0)
    }

    // ---- Fixture loading ----

    pub fn load_document(&self, document: FixtureDocument) -> ExporterResult<()> {
        let db: Database = document.id.parse()?;
        let mut tables = self.tables.write();
        let table = tables.entry(db).or_default();
        let count = document.data.len();
        table.extend(document.data);
        debug!(target: "sonic::store", db = %db, keys = count, "Fixture document loaded");
        Ok(())
    }

    pub fn load_fixture_str(&self, json: &str) -> ExporterResult<()> {
        let document: FixtureDocument = serde_json::from_str(json)
            .map_err(|e| ConfigError::parse(format!("invalid fixture document: {}", e)))?;
        self.load_document(document)
    }

    pub fn load_fixture_file<P: AsRef<Path>>(&self, path: P) -> ExporterResult<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        self.load_fixture_str(&raw).map_err(|e| match e {
            ExporterError::Config(ConfigError::ParseError { message }) => {
                ConfigError::parse(format!("{}: {}", path.display(), message)).into()
            }
            other => other,
        })
    }

    /// Load every `*.json` file in `dir`, in file-name order.
    pub fn load_fixture_dir<P: AsRef<Path>>(&self, dir: P) -> ExporterResult<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();
        for path in &paths {
            self.load_fixture_file(path)?;
        }
        Ok(paths.len())
    }

    pub fn from_fixture_dir<P: AsRef<Path>>(dir: P) -> ExporterResult<Self> {
        let store = Self::new();
        store.load_fixture_dir(dir)?;
        Ok(store)
    }

    async fn enter(&self, operation: &str, deadline: Instant) -> SourceResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        check_deadline(deadline, operation)?;
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SourceError::unavailable(self.endpoint(), "store marked unavailable"));
        }
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::timeout_at(deadline, tokio::time::sleep(latency))
                .await
                .map_err(|_| SourceError::deadline(operation))?;
        }
        Ok(())
    }
}

/// Translate a redis glob (`*`, `?`) into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> SourceResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 12);
    expr.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| SourceError::protocol(format!("invalid pattern {}: {}", pattern, e)))
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn scan_keys(
        &self,
        db: Database,
        pattern: &str,
        count: usize,
        deadline: Instant,
    ) -> SourceResult<Vec<String>> {
        self.enter("SCAN", deadline).await?;
        let matcher = glob_to_regex(pattern)?;
        let keys: Vec<String> = match self.tables.read().get(&db) {
            Some(table) => table.keys().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for page in keys.chunks(count.max(1)) {
            check_deadline(deadline, "SCAN")?;
            out.extend(page.iter().filter(|k| matcher.is_match(k)).cloned());
        }
        Ok(out)
    }

    async fn hget_all(&self, db: Database, key: &str, deadline: Instant) -> SourceResult<FieldMap> {
        self.enter("HGETALL", deadline).await?;
        Ok(self
            .tables
            .read()
            .get(&db)
            .and_then(|table| table.get(key))
            .cloned()
            .unwrap_or_default())
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}
