//! Query planning
//!
//! The steps between a validated payload and storage dispatch: time
//! resolution, legacy tag lowering, TTL extraction, grouping, and group-by
//! expansion into independent payloads.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::types::{QueryFilter, QueryPayload, SubQuery, Tsd};

use super::parser::{expression, relative};
use super::QueryService;

/// Current time in epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Resolve the payload window in place. A relative window overrides any
/// absolute one; absolute windows must start after the epoch and end after
/// they start, with `end == 0` meaning "now".
pub(crate) fn resolve_window(payload: &mut QueryPayload, now_ms: i64) -> Result<()> {
    if !payload.relative.is_empty() {
        payload.start = relative::resolve_relative_start(now_ms, &payload.relative)?;
        payload.end = now_ms;
        return Ok(());
    }

    if payload.start == 0 {
        return Err(Error::validation("start cannot be zero"));
    }
    if payload.end == 0 {
        payload.end = now_ms;
    }
    if payload.end < payload.start {
        return Err(Error::validation(
            "end date must be equal or bigger than start date",
        ));
    }
    Ok(())
}

/// Lower the legacy tag map to wildcard filters. A `*` or pipe-list value
/// becomes a group-by filter, a single literal does not.
pub(crate) fn lower_tags(query: &mut SubQuery) {
    let tags = std::mem::take(&mut query.tags);
    for (key, value) in tags {
        query.filters.push(expression::tag_filter(&key, &value));
    }
}

/// Remove the synthetic `ttl` filter and return its bucket, or the default
/// when absent
pub(crate) fn extract_ttl(filters: &mut Vec<QueryFilter>, default_ttl: i32) -> Result<i32> {
    let position = filters.iter().position(|f| f.tagk == "ttl");
    match position {
        None => Ok(default_ttl),
        Some(i) => {
            let filter = filters.remove(i);
            filter
                .filter
                .parse()
                .map_err(|_| Error::validation(format!("invalid ttl filter: {}", filter.filter)))
        }
    }
}

/// Group descriptors by the tuple of their values for each group-by filter
/// key, in filter declaration order. Without group-by filters everything is
/// one group. Key tuples are compared lexically so group order is stable.
pub(crate) fn build_groups(filters: &[QueryFilter], tsds: Vec<Tsd>) -> Vec<Vec<Tsd>> {
    let group_keys: Vec<&str> = filters
        .iter()
        .filter(|f| f.group_by)
        .map(|f| f.tagk.as_str())
        .collect();

    if group_keys.is_empty() {
        if tsds.is_empty() {
            return Vec::new();
        }
        return vec![tsds];
    }

    let mut groups: BTreeMap<Vec<String>, Vec<Tsd>> = BTreeMap::new();
    for tsd in tsds {
        let key: Vec<String> = group_keys
            .iter()
            .map(|k| tsd.tags.get(*k).cloned().unwrap_or_default())
            .collect();
        groups.entry(key).or_default().push(tsd);
    }

    groups.into_values().collect()
}

impl QueryService {
    /// Expand a payload's group-by filters into one payload per group.
    /// Payloads without group-by filters pass through untouched.
    pub(crate) async fn expand_payload(
        &self,
        keyset: &str,
        payload: QueryPayload,
    ) -> Result<Vec<QueryPayload>> {
        let query = &payload.queries[0];

        if !query.filters.iter().any(|f| f.group_by) {
            return Ok(vec![payload]);
        }

        let context = format!("{}:{}", keyset, query.metric);
        let (tsds, _) = self
            .probe(keyset, &query.metric, &query.filters, &context)
            .await?;

        let groups = build_groups(&query.filters, tsds);

        let mut expanded = Vec::with_capacity(groups.len());
        for group in &groups {
            let Some(filters) = synthesize_group_filters(&query.filters, group) else {
                // a group whose representative lacks a group-by tag is
                // silently dropped
                continue;
            };

            expanded.push(QueryPayload {
                relative: payload.relative.clone(),
                queries: vec![SubQuery {
                    metric: query.metric.clone(),
                    aggregator: query.aggregator.clone(),
                    downsample: query.downsample.clone(),
                    rate: query.rate,
                    rate_options: query.rate_options.clone(),
                    order: query.order.clone(),
                    filter_value: query.filter_value.clone(),
                    tags: BTreeMap::new(),
                    filters,
                }],
                ..Default::default()
            });
        }

        Ok(expanded)
    }
}

/// Concrete filters for one group: non-group-by filters verbatim, plus one
/// pinned wildcard per group-by key taken from the group's representative,
/// unless an existing filter already pins that value. Returns `None` when a
/// group-by tag is empty on the representative.
fn synthesize_group_filters(filters: &[QueryFilter], group: &[Tsd]) -> Option<Vec<QueryFilter>> {
    let representative = group.first()?;

    let mut plain: Vec<QueryFilter> = filters.iter().filter(|f| !f.group_by).cloned().collect();

    for filter in filters.iter().filter(|f| f.group_by) {
        let value = representative
            .tags
            .get(&filter.tagk)
            .cloned()
            .unwrap_or_default();

        let pinned = plain
            .iter()
            .any(|f| f.tagk == filter.tagk && f.filter == value);
        if pinned {
            continue;
        }

        if value.is_empty() {
            return None;
        }

        plain.push(QueryFilter::wildcard(&filter.tagk, value, false));
    }

    Some(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsd(tsuid: &str, tags: &[(&str, &str)]) -> Tsd {
        Tsd {
            tsuid: tsuid.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_resolve_window_relative_overrides() {
        let mut payload = QueryPayload {
            relative: "1h-ago".to_string(),
            start: 42,
            end: 43,
            ..Default::default()
        };
        resolve_window(&mut payload, 10_000_000).unwrap();
        assert_eq!(payload.start, 10_000_000 - 3_600_000);
        assert_eq!(payload.end, 10_000_000);
    }

    #[test]
    fn test_resolve_window_absolute() {
        let mut payload = QueryPayload {
            start: 5_000,
            ..Default::default()
        };
        resolve_window(&mut payload, 9_000).unwrap();
        assert_eq!(payload.end, 9_000, "zero end defaults to now");

        let mut inverted = QueryPayload {
            start: 5_000,
            end: 4_000,
            ..Default::default()
        };
        assert!(resolve_window(&mut inverted, 9_000).is_err());

        let mut zero = QueryPayload::default();
        assert!(resolve_window(&mut zero, 9_000).is_err());
    }

    #[test]
    fn test_lower_tags() {
        let mut query = SubQuery {
            metric: "cpu".to_string(),
            aggregator: "sum".to_string(),
            tags: BTreeMap::from([
                ("host".to_string(), "*".to_string()),
                ("core".to_string(), "0".to_string()),
                ("rack".to_string(), "a|b".to_string()),
            ]),
            ..Default::default()
        };
        lower_tags(&mut query);
        assert!(query.tags.is_empty());
        assert_eq!(query.filters.len(), 3);

        let by_key = |k: &str| query.filters.iter().find(|f| f.tagk == k).unwrap();
        assert!(!by_key("core").group_by);
        assert!(by_key("host").group_by);
        assert!(by_key("rack").group_by);
        assert!(query.filters.iter().all(|f| f.ftype == "wildcard"));
    }

    #[test]
    fn test_extract_ttl() {
        // the ttl filter selects the bucket and disappears
        let mut filters = vec![
            QueryFilter::wildcard("ttl", "7", false),
            QueryFilter::wildcard("host", "a", false),
        ];
        let ttl = extract_ttl(&mut filters, 90).unwrap();
        assert_eq!(ttl, 7);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].tagk, "host");

        let mut none = vec![QueryFilter::wildcard("host", "a", false)];
        assert_eq!(extract_ttl(&mut none, 90).unwrap(), 90);

        let mut bad = vec![QueryFilter::wildcard("ttl", "week", false)];
        assert!(extract_ttl(&mut bad, 90).is_err());
    }

    #[test]
    fn test_build_groups_by_tag_tuple() {
        let filters = vec![
            QueryFilter::wildcard("host", "*", true),
            QueryFilter::wildcard("core", "0", false),
        ];
        let tsds = vec![
            tsd("1", &[("host", "a"), ("core", "0")]),
            tsd("2", &[("host", "b"), ("core", "0")]),
            tsd("3", &[("host", "a"), ("core", "1")]),
        ];
        let groups = build_groups(&filters, tsds);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2, "host=a series group together");
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn test_build_groups_without_group_by() {
        let filters = vec![QueryFilter::wildcard("host", "a", false)];
        let groups = build_groups(&filters, vec![tsd("1", &[("host", "a")])]);
        assert_eq!(groups.len(), 1);

        assert!(build_groups(&filters, vec![]).is_empty());
    }

    #[test]
    fn test_synthesize_pins_group_values() {
        let filters = vec![
            QueryFilter::wildcard("host", "*", true),
            QueryFilter::wildcard("core", "0", false),
        ];
        let group = vec![tsd("1", &[("host", "a"), ("core", "0")])];
        let synthesized = synthesize_group_filters(&filters, &group).unwrap();
        assert_eq!(synthesized.len(), 2);
        let host = synthesized.iter().find(|f| f.tagk == "host").unwrap();
        assert_eq!(host.filter, "a");
        assert!(!host.group_by);
    }

    #[test]
    fn test_synthesize_skips_already_pinned() {
        let filters = vec![
            QueryFilter::wildcard("host", "a", false),
            QueryFilter::wildcard("host", "*", true),
        ];
        let group = vec![tsd("1", &[("host", "a")])];
        let synthesized = synthesize_group_filters(&filters, &group).unwrap();
        assert_eq!(synthesized.len(), 1, "pinned value is not duplicated");
    }

    #[test]
    fn test_synthesize_drops_group_with_empty_tag() {
        let filters = vec![
            QueryFilter::wildcard("host", "*", true),
            QueryFilter::wildcard("rack", "*", true),
        ];
        let group = vec![tsd("1", &[("host", "a")])];
        assert!(synthesize_group_filters(&filters, &group).is_none());
    }
}
