//! In-memory stand-ins for the external collaborators
//!
//! Used by the integration tests and by the standalone server binary.
//! None of these are suitable for production: the index and cache lose
//! everything on restart and the storage returns canned or synthesized
//! results instead of reading a column store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::metadata::{MetadataCache, MetadataIndex, SuggestKind};
use crate::storage::{DataOperations, Point, SeriesResult, Storage};
use crate::telnet::{Collector, TelnetPoint};
use crate::types::{QueryFilter, Tsd};

// ============================================================================
// Metadata index
// ============================================================================

/// In-memory metadata index
#[derive(Default)]
pub struct InMemoryMetadataIndex {
    keysets: RwLock<HashSet<String>>,
    // keyset -> metric -> descriptors
    series: RwLock<HashMap<String, HashMap<String, Vec<Tsd>>>>,
}

impl InMemoryMetadataIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keyset
    pub fn add_keyset(&self, keyset: &str) {
        self.keysets.write().insert(keyset.to_string());
    }

    /// Register one timeseries descriptor
    pub fn add_series(&self, keyset: &str, metric: &str, tsuid: &str, tags: &[(&str, &str)]) {
        self.add_keyset(keyset);
        let tsd = Tsd {
            tsuid: tsuid.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.series
            .write()
            .entry(keyset.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .push(tsd);
    }
}

/// Whether `value` matches one pipe-separated alternative of a glob pattern
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    pattern.split('|').any(|member| glob_matches(member, value))
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(after) => rest = after,
                None => return false,
            }
        } else if i == segments.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

fn filter_matches(filter: &QueryFilter, tsd: &Tsd) -> bool {
    let value = match tsd.tags.get(&filter.tagk) {
        Some(value) => value,
        None => return false,
    };
    match filter.ftype.as_str() {
        "wildcard" => wildcard_matches(&filter.filter, value),
        "literal_or" => filter.filter.split('|').any(|member| member == value),
        "not_literal_or" => filter.filter.split('|').all(|member| member != value),
        // close enough for a stub
        "regexp" => value.contains(filter.filter.trim_matches(&['^', '$', '.', '*'][..])),
        _ => false,
    }
}

#[async_trait]
impl MetadataIndex for InMemoryMetadataIndex {
    async fn lookup(
        &self,
        keyset: &str,
        metric: &str,
        filters: &[QueryFilter],
        limit: usize,
    ) -> Result<(Vec<Tsd>, usize)> {
        let series = self.series.read();
        let candidates = series
            .get(keyset)
            .and_then(|metrics| metrics.get(metric))
            .cloned()
            .unwrap_or_default();

        let matches: Vec<Tsd> = candidates
            .into_iter()
            .filter(|tsd| filters.iter().all(|f| filter_matches(f, tsd)))
            .collect();

        let total = matches.len();
        let capped: Vec<Tsd> = matches.into_iter().take(limit).collect();
        Ok((capped, total))
    }

    async fn suggest(
        &self,
        keyset: &str,
        kind: SuggestKind,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<String>> {
        let prefix = prefix.strip_suffix('*').unwrap_or(prefix);
        let series = self.series.read();
        let mut names: HashSet<String> = HashSet::new();

        if let Some(metrics) = series.get(keyset) {
            for (metric, tsds) in metrics {
                match kind {
                    SuggestKind::Metric => {
                        names.insert(metric.clone());
                    }
                    SuggestKind::TagKey => {
                        for tsd in tsds {
                            names.extend(tsd.tags.keys().cloned());
                        }
                    }
                    SuggestKind::TagValue => {
                        for tsd in tsds {
                            names.extend(tsd.tags.values().cloned());
                        }
                    }
                }
            }
        }

        let mut names: Vec<String> = names
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names.truncate(max);
        Ok(names)
    }

    async fn check_keyset(&self, keyset: &str) -> Result<bool> {
        Ok(self.keysets.read().contains(keyset))
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Arguments of one recorded `get_series` call
#[derive(Debug, Clone)]
pub struct RecordedFetch {
    /// TTL bucket the executor selected
    pub ttl: i32,
    /// Batched tsuids
    pub tsuids: Vec<String>,
    /// Window start in milliseconds
    pub start_ms: i64,
    /// Window end in milliseconds
    pub end_ms: i64,
    /// Operation bundle
    pub opers: DataOperations,
    /// Millisecond keying requested
    pub ms_resolution: bool,
    /// Empty buckets kept
    pub keep_empty: bool,
}

/// In-memory storage double: replays queued results (or a synthesized
/// default) and records every call for inspection
#[derive(Default)]
pub struct InMemoryStorage {
    canned: Mutex<Vec<SeriesResult>>,
    calls: Mutex<Vec<RecordedFetch>>,
}

impl InMemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result; queued results are replayed in order
    pub fn push_result(&self, result: SeriesResult) {
        self.canned.lock().push(result);
    }

    /// Everything `get_series` was called with so far
    pub fn calls(&self) -> Vec<RecordedFetch> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_series(
        &self,
        ttl: i32,
        tsuids: Vec<String>,
        start_ms: i64,
        end_ms: i64,
        opers: &DataOperations,
        ms_resolution: bool,
        keep_empty: bool,
    ) -> Result<SeriesResult> {
        self.calls.lock().push(RecordedFetch {
            ttl,
            tsuids: tsuids.clone(),
            start_ms,
            end_ms,
            opers: opers.clone(),
            ms_resolution,
            keep_empty,
        });

        if let Some(result) = {
            let mut canned = self.canned.lock();
            if canned.is_empty() {
                None
            } else {
                Some(canned.remove(0))
            }
        } {
            return Ok(result);
        }

        // default: two points at the window edges
        let data = vec![
            Point {
                date: start_ms,
                value: 1.0,
                empty: false,
            },
            Point {
                date: end_ms,
                value: 2.0,
                empty: false,
            },
        ];
        Ok(SeriesResult {
            total: data.len(),
            count: data.len(),
            processed_bytes: (data.len() * 16) as u64,
            data,
        })
    }
}

// ============================================================================
// Cache and collector
// ============================================================================

/// In-memory metadata cache
#[derive(Default)]
pub struct InMemoryMetadataCache {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryMetadataCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl MetadataCache for InMemoryMetadataCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Collector that records nothing beyond a debug line
pub struct LoggingCollector;

#[async_trait]
impl Collector for LoggingCollector {
    async fn handle_point(&self, point: TelnetPoint) -> Result<()> {
        debug!(metric = %point.metric, timestamp = point.timestamp, "point collected");
        Ok(())
    }
}

/// Collector that stores every point, for tests
#[derive(Default)]
pub struct RecordingCollector {
    points: Mutex<Vec<TelnetPoint>>,
}

impl RecordingCollector {
    /// Empty collector
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Points received so far
    pub fn points(&self) -> Vec<TelnetPoint> {
        self.points.lock().clone()
    }
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn handle_point(&self, point: TelnetPoint) -> Result<()> {
        self.points.lock().push(point);
        Ok(())
    }
}
