//! Query service
//!
//! The front door for everything query-shaped: expression check/parse/
//! compile/expand, textual lookup, suggestions and full query execution.
//! Planning lives in [`planner`], execution in [`executor`], and both are
//! bounded by the process-wide [`gates::ConcurrencyGates`].

pub mod executor;
pub mod gates;
pub mod parser;
pub mod planner;

pub use gates::ConcurrencyGates;

use std::sync::Arc;

use tracing::warn;

use crate::config::QuerySettings;
use crate::error::{Error, Result};
use crate::metadata::{MetadataCache, MetadataIndex, SuggestKind};
use crate::storage::Storage;
use crate::types::{LookupResponse, QueryPayload, ResponseEntry, Tsd};

use parser::expression;

/// Result of a full query: response entries plus the bytes the storage
/// layer read to produce them
#[derive(Debug, Default)]
pub struct QueryOutcome {
    /// Sorted response entries
    pub entries: Vec<ResponseEntry>,
    /// Bytes read from storage, surfaced as `X-Processed-Bytes`
    pub processed_bytes: u64,
}

/// The query planner/executor service
pub struct QueryService {
    index: Arc<dyn MetadataIndex>,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn MetadataCache>,
    gates: ConcurrencyGates,
    max_timeseries: usize,
    log_query_threshold: usize,
    default_ttl: i32,
    default_max_results: usize,
    query_timeout: std::time::Duration,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("max_timeseries", &self.max_timeseries)
            .field("log_query_threshold", &self.log_query_threshold)
            .field("default_ttl", &self.default_ttl)
            .field("default_max_results", &self.default_max_results)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl QueryService {
    /// Build the service, validating the configured limits
    pub fn new(
        settings: &QuerySettings,
        index: Arc<dyn MetadataIndex>,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn MetadataCache>,
    ) -> Result<Self> {
        if settings.max_timeseries < 1 {
            return Err(Error::init("max_timeseries must be bigger than zero"));
        }
        if settings.log_query_threshold < 1 {
            return Err(Error::init("log_query_threshold must be bigger than zero"));
        }
        let gates = ConcurrencyGates::new(
            settings.max_concurrent_reads,
            settings.max_concurrent_timeseries,
        )?;

        Ok(Self {
            index,
            storage,
            cache,
            gates,
            max_timeseries: settings.max_timeseries,
            log_query_threshold: settings.log_query_threshold,
            default_ttl: settings.default_ttl,
            default_max_results: settings.default_max_results,
            query_timeout: settings.query_timeout(),
        })
    }

    /// Parse and validate an expression without executing it
    pub fn check(&self, expression: &str) -> Result<()> {
        self.payload_from_expression(expression)?;
        Ok(())
    }

    /// Parse an expression into payloads, optionally expanding group-by
    /// filters into one payload per group
    pub async fn parse_expression(
        &self,
        expression: &str,
        expand: bool,
        keyset: Option<&str>,
    ) -> Result<Vec<QueryPayload>> {
        if expand {
            let keyset = keyset
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::validation("keyset cannot be empty when expand is true"))?;
            if !self.keyset_exists(keyset).await? {
                return Err(Error::not_found(format!("keyset not found: {keyset}")));
            }
            let payload = self.payload_from_expression(expression)?;
            self.expand_payload(keyset, payload).await
        } else {
            Ok(vec![self.payload_from_expression(expression)?])
        }
    }

    /// Parse, expand and compile an expression into sorted canonical strings
    pub async fn expand_expression(&self, keyset: &str, expression: &str) -> Result<Vec<String>> {
        if !self.keyset_exists(keyset).await? {
            return Err(Error::not_found(format!("keyset not found: {keyset}")));
        }
        let payload = self.payload_from_expression(expression)?;
        let expanded = self.expand_payload(keyset, payload).await?;
        let mut expressions = expression::compile_payloads(&expanded)?;
        expressions.sort();
        Ok(expressions)
    }

    /// Compile a structural payload back to expressions. Only relative
    /// payloads can be compiled: both `start` and `end` must be unset.
    pub fn compile(&self, payload: &QueryPayload) -> Result<Vec<String>> {
        if payload.relative.is_empty() {
            return Err(Error::validation("field relative cannot be empty"));
        }
        if payload.start != 0 || payload.end != 0 {
            return Err(Error::validation(
                "expression compile supports only relative times, start and end must be empty",
            ));
        }
        payload.validate()?;
        expression::compile_payloads(std::slice::from_ref(payload))
    }

    /// Look up the timeseries matching a textual `metric{k=v,…}` query
    pub async fn lookup(&self, keyset: &str, textual: &str) -> Result<LookupResponse> {
        let (metric, tags) = parser::parse_lookup_query(textual)?;
        let filters: Vec<_> = tags
            .iter()
            .map(|tag| expression::tag_filter(&tag.key, &tag.value))
            .collect();

        let (results, total) = self
            .probe(keyset, &metric, &filters, textual)
            .await?;

        Ok(LookupResponse {
            lookup_type: "LOOKUP".to_string(),
            metric,
            tags,
            results,
            total_results: total,
        })
    }

    /// Suggest names with the given prefix, sorted
    pub async fn suggest(
        &self,
        keyset: &str,
        kind: SuggestKind,
        prefix: &str,
        max: Option<usize>,
    ) -> Result<Vec<String>> {
        let max = max.unwrap_or(self.default_max_results);
        let mut names = self
            .index
            .suggest(keyset, kind, &format!("{prefix}*"), max)
            .await?;
        names.sort();
        Ok(names)
    }

    /// Parse an expression into a validated single-query payload
    fn payload_from_expression(&self, expression: &str) -> Result<QueryPayload> {
        if expression.trim().is_empty() {
            return Err(Error::EmptyExpression);
        }
        let (relative, sub) = expression::parse_expression(expression)?;
        let payload = QueryPayload {
            relative,
            queries: vec![sub],
            ..Default::default()
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Whether the keyset exists, consulting the metadata cache first.
    /// Cache failures degrade to index hits instead of failing the request.
    async fn keyset_exists(&self, keyset: &str) -> Result<bool> {
        let cache_key = format!("keyset:{keyset}");
        match self.cache.get(&cache_key).await {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            Err(e) => warn!(keyset, error = %e, "metadata cache read failed"),
        }

        let found = self.index.check_keyset(keyset).await?;
        if found {
            if let Err(e) = self.cache.set(&cache_key, "1".to_string()).await {
                warn!(keyset, error = %e, "metadata cache write failed");
            }
        }
        Ok(found)
    }

    /// Probe the metadata index, logging when the threshold is crossed and
    /// failing when the fan-out limit is. The threshold entry carries the
    /// filter list that produced the match count.
    pub(crate) async fn probe(
        &self,
        keyset: &str,
        metric: &str,
        filters: &[crate::types::QueryFilter],
        context: &str,
    ) -> Result<(Vec<Tsd>, usize)> {
        let (tsds, total) = self
            .index
            .lookup(keyset, metric, filters, self.max_timeseries)
            .await?;

        if total > self.log_query_threshold {
            warn!(
                keyset,
                metric,
                total,
                limit = self.max_timeseries,
                query = context,
                filters = ?filters,
                "timeseries threshold exceeded"
            );
        }
        if total > self.max_timeseries {
            return Err(Error::TsLimitExceeded {
                total,
                limit: self.max_timeseries,
            });
        }

        Ok((tsds, total))
    }
}
