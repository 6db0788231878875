//! Metadata index and cache contracts
//!
//! The inverted index over metric/tag tuples and the distributed cache in
//! front of it are external services; the query service only depends on
//! these traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{QueryFilter, Tsd};

/// What a suggest request completes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestKind {
    /// Metric names
    Metric,
    /// Tag keys
    TagKey,
    /// Tag values
    TagValue,
}

/// Inverted index over metric/tag tuples, scoped by keyset
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Return up to `limit` descriptors matching the filters, plus the full
    /// match count (which may exceed `limit`)
    async fn lookup(
        &self,
        keyset: &str,
        metric: &str,
        filters: &[QueryFilter],
        limit: usize,
    ) -> Result<(Vec<Tsd>, usize)>;

    /// Return up to `max` names with the given prefix; the prefix already
    /// carries its trailing `*`
    async fn suggest(
        &self,
        keyset: &str,
        kind: SuggestKind,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<String>>;

    /// Whether the keyset exists
    async fn check_keyset(&self, keyset: &str) -> Result<bool>;
}

/// Opaque string cache in front of metadata lookups
#[async_trait]
pub trait MetadataCache: Send + Sync {
    /// Fetch a cached value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value
    async fn set(&self, key: &str, value: String) -> Result<()>;
}
