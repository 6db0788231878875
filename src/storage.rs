//! Storage engine contract
//!
//! The key-value column store is an external collaborator addressed by
//! `(ttl, tsuid, time range)`. Aggregation happens server-side: the executor
//! sends a bundle of operations and only formats what comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::RateOptions;

/// Downsample operation sent to storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Downsample {
    /// Whether downsampling is requested
    pub enabled: bool,
    /// Bucket parameters, meaningful when enabled
    pub options: DownsampleOptions,
}

/// Downsample bucket parameters, long-unit wire form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownsampleOptions {
    /// Bucket width
    pub value: i64,
    /// Long unit name: `ms|sec|min|hour|day|week|month|year`
    pub unit: String,
    /// Bucket aggregation function (`pnt` for point counts)
    pub downsample: String,
    /// Fill policy: `none|null|nan|zero`
    pub fill: String,
}

/// Rate operation sent to storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateOperation {
    /// Whether rate conversion is requested
    pub enabled: bool,
    /// Counter handling options
    pub options: RateOptions,
}

/// Point predicate sent to storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterValueOperation {
    /// Whether value filtering is requested
    pub enabled: bool,
    /// Comparison operator: `>= <= == > <`
    pub bool_oper: String,
    /// Comparison literal
    pub value: f64,
}

/// The operation bundle applied server-side to a batch of series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataOperations {
    /// Time-bucketed aggregation
    pub downsample: Downsample,
    /// Cross-series merge function (`pnt` for point counts)
    pub merge: String,
    /// Rate conversion
    pub rate: RateOperation,
    /// Point predicate
    pub filter_value: FilterValueOperation,
    /// Application order of the enabled operations, innermost first
    pub order: Vec<String>,
}

/// One returned point
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Point timestamp in milliseconds
    pub date: i64,
    /// Point value
    pub value: f64,
    /// True for buckets the downsample filled in
    pub empty: bool,
}

/// Merged result of one storage fetch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesResult {
    /// Ordered points
    pub data: Vec<Point>,
    /// Points scanned before filtering
    pub total: usize,
    /// Points returned
    pub count: usize,
    /// Bytes read from the store to produce this result
    pub processed_bytes: u64,
}

/// Key-value column store accessed by id, TTL bucket and time range
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch and merge a batch of series
    #[allow(clippy::too_many_arguments)]
    async fn get_series(
        &self,
        ttl: i32,
        tsuids: Vec<String>,
        start_ms: i64,
        end_ms: i64,
        opers: &DataOperations,
        ms_resolution: bool,
        keep_empty: bool,
    ) -> Result<SeriesResult>;
}
