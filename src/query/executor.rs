//! Query execution
//!
//! Turns planned groups into storage fetches and storage results into
//! OpenTSDB response entries. Every fetch holds one slot on each
//! concurrency gate, reads first; groups of a sub-query are dispatched
//! concurrently and any failure aborts the whole request.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::storage::{
    DataOperations, Downsample, DownsampleOptions, FilterValueOperation, RateOperation,
};
use crate::types::{
    parse_filter_value, sort_response_entries, DownsampleSpec, QueryPayload, ResponseEntry,
    SubQuery, Tsd,
};

use super::{planner, QueryOutcome, QueryService};

/// What one group fetch produced
struct GroupResult {
    entry: Option<ResponseEntry>,
    total: usize,
    count: usize,
    bytes: u64,
}

impl QueryService {
    /// Plan and execute a full query request within the configured deadline.
    /// On expiry the in-flight work is dropped, which releases any held gate
    /// slots and cancels outstanding storage and index calls.
    pub async fn query(&self, keyset: &str, payload: QueryPayload) -> Result<QueryOutcome> {
        match tokio::time::timeout(self.query_timeout, self.run_query(keyset, payload)).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::Error::external(504, "query deadline exceeded")),
        }
    }

    async fn run_query(&self, keyset: &str, mut payload: QueryPayload) -> Result<QueryOutcome> {
        payload.validate()?;
        planner::resolve_window(&mut payload, planner::now_ms())?;

        let mut outcome = QueryOutcome::default();
        let mut sum_total_points = 0usize;
        let mut sum_count_points = 0usize;

        let queries = std::mem::take(&mut payload.queries);
        for mut query in queries {
            let downsample = wire_downsample(&query)?;
            planner::lower_tags(&mut query);
            let ttl = planner::extract_ttl(&mut query.filters, self.default_ttl)?;

            let context = format!("{}:{}", keyset, query.metric);
            let (tsds, _) = self
                .probe(keyset, &query.metric, &query.filters, &context)
                .await?;
            if tsds.is_empty() {
                continue;
            }

            let groups = planner::build_groups(&query.filters, tsds);
            let fetches = groups
                .into_iter()
                .map(|group| self.execute_group(ttl, &payload, &query, &downsample, group));
            let results = try_join_all(fetches).await?;

            for result in results {
                sum_total_points += result.total;
                sum_count_points += result.count;
                outcome.processed_bytes += result.bytes;
                if let Some(entry) = result.entry {
                    outcome.entries.push(entry);
                }
            }
        }

        debug!(
            keyset,
            total_points = sum_total_points,
            count_points = sum_count_points,
            processed_bytes = outcome.processed_bytes,
            "query executed"
        );

        sort_response_entries(&mut outcome.entries);
        Ok(outcome)
    }

    /// Fetch one group from storage and build its response entry
    async fn execute_group(
        &self,
        ttl: i32,
        payload: &QueryPayload,
        query: &SubQuery,
        downsample: &Downsample,
        group: Vec<Tsd>,
    ) -> Result<GroupResult> {
        let mut ids = Vec::with_capacity(group.len());
        let mut tag_values: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for tsd in &group {
            for (k, v) in &tsd.tags {
                tag_values.entry(k.as_str()).or_default().insert(v.as_str());
            }
            ids.push(tsd.tsuid.clone());
        }

        let opers = wire_operations(query, downsample)?;
        let keep_empty = downsample.enabled && downsample.options.fill != "none";

        let series = {
            // reads gate first, then the timeseries gate; released in
            // reverse when the slot drops
            let _slot = self.gates.acquire().await;
            self.storage
                .get_series(
                    ttl,
                    ids.clone(),
                    payload.start,
                    payload.end,
                    &opers,
                    payload.ms_resolution,
                    keep_empty,
                )
                .await?
        };

        debug!(
            metric = %query.metric,
            series = ids.len(),
            total_points = series.total,
            count_points = series.count,
            "group fetched"
        );

        let mut dps = BTreeMap::new();
        for point in &series.data {
            let epoch = if payload.ms_resolution {
                point.date
            } else {
                point.date / 1000
            };
            let value = if point.empty {
                match downsample.options.fill.as_str() {
                    "null" => Value::Null,
                    "nan" => Value::String("NaN".to_string()),
                    _ => number(point.value),
                }
            } else {
                number(point.value)
            };
            dps.insert(epoch.to_string(), value);
        }

        let entry = if dps.is_empty() {
            None
        } else {
            let mut tags = BTreeMap::new();
            let mut aggregated_tags = Vec::new();
            for (key, values) in &tag_values {
                if values.len() == 1 {
                    tags.insert(
                        key.to_string(),
                        values.iter().next().map(|v| v.to_string()).unwrap_or_default(),
                    );
                } else {
                    aggregated_tags.push(key.to_string());
                }
            }

            Some(ResponseEntry {
                metric: query.metric.clone(),
                tags,
                aggregated_tags,
                dps,
                tsuids: payload.show_tsuids.then_some(ids),
            })
        };

        Ok(GroupResult {
            entry,
            total: series.total,
            count: series.count,
            bytes: series.processed_bytes,
        })
    }
}

/// The downsample bundle in storage wire form: long unit names and the
/// `pnt` alias for point counts
fn wire_downsample(query: &SubQuery) -> Result<Downsample> {
    if query.downsample.is_empty() {
        return Ok(Downsample::default());
    }
    let spec = DownsampleSpec::parse(&query.downsample)?;
    Ok(Downsample {
        enabled: true,
        options: DownsampleOptions {
            value: spec.value,
            unit: spec.long_unit().to_string(),
            downsample: spec.func.clone(),
            fill: spec.fill,
        },
    })
}

/// The full operation bundle for one group fetch
fn wire_operations(query: &SubQuery, downsample: &Downsample) -> Result<DataOperations> {
    let mut rate_options = query.rate_options.clone();
    if rate_options.counter_max.is_none() {
        rate_options.counter_max = Some(i64::MAX);
    }

    let filter_value = if query.filter_value.is_empty() {
        FilterValueOperation::default()
    } else {
        let (oper, value) = parse_filter_value(&query.filter_value)?;
        FilterValueOperation {
            enabled: true,
            bool_oper: oper,
            value,
        }
    };

    let merge = if query.aggregator == "count" {
        "pnt".to_string()
    } else {
        query.aggregator.clone()
    };

    Ok(DataOperations {
        downsample: downsample.clone(),
        merge,
        rate: RateOperation {
            enabled: query.rate,
            options: rate_options,
        },
        filter_value,
        order: query.order.clone(),
    })
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
