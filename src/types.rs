//! Query data model
//!
//! OpenTSDB-compatible payloads plus the pieces shared by the parsers,
//! the planner and the executor: downsample specs, filter-value predicates
//! and payload validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Aggregators accepted by `merge` and sub-query validation
pub const VALID_AGGREGATORS: &[&str] = &["sum", "avg", "min", "max", "count"];

/// Fill policies accepted in downsample specs
pub const VALID_FILLS: &[&str] = &["none", "null", "nan", "zero"];

/// Filter types accepted in structured payloads (OpenTSDB set)
pub const VALID_FILTER_TYPES: &[&str] = &["wildcard", "literal_or", "not_literal_or", "regexp"];

/// Operation tokens accepted in a sub-query `order` list. `aggregation`
/// names the merge step, which the expression form keeps outermost.
pub const VALID_ORDER_TOKENS: &[&str] = &["downsample", "aggregation", "rate", "filter"];

/// A query request, scoped to a keyset carried out-of-band
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Absolute window start in milliseconds; ignored when `relative` is set
    #[serde(default)]
    pub start: i64,

    /// Absolute window end in milliseconds; 0 means "now"
    #[serde(default)]
    pub end: i64,

    /// Relative window expression such as `1h-ago`; overrides `start`/`end`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relative: String,

    /// Sub-queries to execute against the window
    pub queries: Vec<SubQuery>,

    /// Key `dps` entries by milliseconds instead of seconds
    #[serde(default, rename = "msResolution")]
    pub ms_resolution: bool,

    /// Include the matched tsuids in each response entry
    #[serde(default, rename = "showTSUIDs")]
    pub show_tsuids: bool,
}

/// One metric query within a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    /// Metric name
    pub metric: String,

    /// Merge aggregator: `sum|avg|min|max|count`
    pub aggregator: String,

    /// Downsample spec `<N><unit>-<fn>[-<fill>]`, empty when disabled
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub downsample: String,

    /// Apply a rate conversion before merging
    #[serde(default)]
    pub rate: bool,

    /// Rate conversion options, meaningful when `rate` is set
    #[serde(default, rename = "rateOptions")]
    pub rate_options: RateOptions,

    /// Application order of the enabled operations, innermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,

    /// Point predicate such as `>=5`, empty when disabled
    #[serde(default, rename = "filterValue", skip_serializing_if = "String::is_empty")]
    pub filter_value: String,

    /// Legacy tag map; lowered to wildcard filters during planning
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Structured filters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<QueryFilter>,
}

/// Rate conversion options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateOptions {
    /// Treat the series as a monotonically increasing counter
    #[serde(default)]
    pub counter: bool,

    /// Counter wrap value; defaults to `i64::MAX` at dispatch
    #[serde(default, rename = "counterMax")]
    pub counter_max: Option<i64>,

    /// Deltas larger than this are treated as counter resets
    #[serde(default, rename = "resetValue")]
    pub reset_value: i64,
}

/// A tag filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Filter type: `wildcard|literal_or|not_literal_or|regexp`
    #[serde(rename = "type")]
    pub ftype: String,

    /// Tag key the filter applies to
    pub tagk: String,

    /// Filter pattern
    pub filter: String,

    /// Split matches into one sub-series per distinct value of `tagk`
    #[serde(default, rename = "groupBy")]
    pub group_by: bool,
}

impl QueryFilter {
    /// A wildcard filter, the type legacy tags lower to
    pub fn wildcard(tagk: impl Into<String>, filter: impl Into<String>, group_by: bool) -> Self {
        Self {
            ftype: "wildcard".to_string(),
            tagk: tagk.into(),
            filter: filter.into(),
            group_by,
        }
    }
}

/// Timeseries descriptor returned by the metadata index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tsd {
    /// Storage-addressable timeseries id
    pub tsuid: String,

    /// Full tag set of the series
    pub tags: BTreeMap<String, String>,
}

/// A `(key, value)` pair parsed from a textual `metric{k=v,…}` query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value, possibly empty
    pub value: String,
}

/// One entry of a query response, OpenTSDB wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEntry {
    /// Metric name
    pub metric: String,

    /// Tag keys whose value is common to every series in the group
    pub tags: BTreeMap<String, String>,

    /// Tag keys whose values varied within the group
    #[serde(rename = "aggregateTags")]
    pub aggregated_tags: Vec<String>,

    /// Epoch (seconds or milliseconds) to value; fill policy decides the
    /// encoding of empty buckets
    pub dps: BTreeMap<String, serde_json::Value>,

    /// Matched tsuids, present when the request set `showTSUIDs`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsuids: Option<Vec<String>>,
}

/// Sort response entries by `(metric, tags)` for deterministic output
pub fn sort_response_entries(entries: &mut [ResponseEntry]) {
    entries.sort_by(|a, b| a.metric.cmp(&b.metric).then_with(|| a.tags.cmp(&b.tags)));
}

/// Response of the textual lookup endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Constant marker, `LOOKUP`
    #[serde(rename = "type")]
    pub lookup_type: String,

    /// Looked-up metric
    pub metric: String,

    /// Tags given in the textual query
    pub tags: Vec<Tag>,

    /// Matched descriptors, capped by `max_timeseries`
    pub results: Vec<Tsd>,

    /// Full match count
    #[serde(rename = "totalResults")]
    pub total_results: usize,
}

// ============================================================================
// Downsample spec
// ============================================================================

/// A parsed downsample spec such as `30m-avg-null`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownsampleSpec {
    /// Bucket width
    pub value: i64,
    /// Short unit: `ms|s|m|h|d|w|n|y` (`n` is months)
    pub unit: String,
    /// Bucket aggregation function; `count` is rewritten to `pnt`
    pub func: String,
    /// Fill policy for empty buckets
    pub fill: String,
}

impl DownsampleSpec {
    /// Parse `<N><unit>-<fn>[-<fill>]`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split('-').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::validation(format!("invalid downsample: {spec}")));
        }

        let head = parts[0];
        if !head.is_ascii() {
            return Err(Error::validation(format!("invalid downsample: {spec}")));
        }
        // `ms` is the only two-character unit
        let (digits, unit) = if head.len() > 2 && head.ends_with("ms") {
            (&head[..head.len() - 2], "ms")
        } else if head.len() > 1 {
            let (d, u) = head.split_at(head.len() - 1);
            (d, u)
        } else {
            return Err(Error::validation(format!("invalid downsample: {spec}")));
        };

        if !matches!(unit, "ms" | "s" | "m" | "h" | "d" | "w" | "n" | "y") {
            return Err(Error::validation(format!(
                "invalid downsample unit: {unit}"
            )));
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| Error::validation(format!("invalid downsample value: {digits}")))?;
        if value <= 0 {
            return Err(Error::validation(format!(
                "downsample value must be positive: {value}"
            )));
        }

        let mut func = parts[1].to_string();
        if func.is_empty() {
            return Err(Error::validation(format!("invalid downsample: {spec}")));
        }
        if func == "count" {
            func = "pnt".to_string();
        }

        let fill = if parts.len() == 3 { parts[2] } else { "none" };
        if !VALID_FILLS.contains(&fill) {
            return Err(Error::validation(format!("invalid downsample fill: {fill}")));
        }

        Ok(Self {
            value,
            unit: unit.to_string(),
            func,
            fill: fill.to_string(),
        })
    }

    /// Long unit name used on the storage wire
    pub fn long_unit(&self) -> &'static str {
        match self.unit.as_str() {
            "ms" => "ms",
            "s" => "sec",
            "m" => "min",
            "h" => "hour",
            "d" => "day",
            "w" => "week",
            "n" => "month",
            _ => "year",
        }
    }
}

// ============================================================================
// Filter-value predicate
// ============================================================================

/// Parse a point predicate: one of `>= <= == > <` followed by a decimal.
/// Two-character operators take precedence over one-character ones.
pub fn parse_filter_value(raw: &str) -> Result<(String, f64)> {
    const TWO_CHAR: [&str; 3] = [">=", "<=", "=="];
    const ONE_CHAR: [&str; 2] = [">", "<"];

    let oper = TWO_CHAR
        .iter()
        .chain(ONE_CHAR.iter())
        .find(|op| raw.starts_with(*op))
        .ok_or_else(|| Error::validation(format!("invalid filter value: {raw}")))?;
    let literal = &raw[oper.len()..];

    let value: f64 = literal
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid filter value literal: {literal}")))?;

    Ok((oper.to_string(), value))
}

// ============================================================================
// Validation
// ============================================================================

impl QueryPayload {
    /// Validate structure without touching external services
    pub fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            return Err(Error::validation("payload has no queries"));
        }
        if self.relative.is_empty() && self.start == 0 {
            return Err(Error::validation("start cannot be zero"));
        }
        for query in &self.queries {
            query.validate()?;
        }
        Ok(())
    }
}

impl SubQuery {
    /// Validate one sub-query
    pub fn validate(&self) -> Result<()> {
        if self.metric.is_empty() {
            return Err(Error::validation("metric cannot be empty"));
        }
        if !VALID_AGGREGATORS.contains(&self.aggregator.as_str()) {
            return Err(Error::validation(format!(
                "invalid aggregator: {}",
                self.aggregator
            )));
        }
        if !self.downsample.is_empty() {
            DownsampleSpec::parse(&self.downsample)?;
        }
        if !self.filter_value.is_empty() {
            parse_filter_value(&self.filter_value)?;
        }
        let mut seen = Vec::new();
        for token in &self.order {
            if !VALID_ORDER_TOKENS.contains(&token.as_str()) {
                return Err(Error::validation(format!("invalid order token: {token}")));
            }
            if seen.contains(token) {
                return Err(Error::validation(format!("duplicated order token: {token}")));
            }
            seen.push(token.clone());
        }
        for filter in &self.filters {
            if filter.tagk.is_empty() {
                return Err(Error::validation("filter tagk cannot be empty"));
            }
            if !VALID_FILTER_TYPES.contains(&filter.ftype.as_str()) {
                return Err(Error::validation(format!(
                    "invalid filter type: {}",
                    filter.ftype
                )));
            }
        }
        Ok(())
    }
}
