//! Query service end-to-end scenarios against the in-memory doubles

use std::sync::Arc;

use mycenae::config::QuerySettings;
use mycenae::metadata::MetadataCache;
use mycenae::storage::{Point, SeriesResult};
use mycenae::stubs::{InMemoryMetadataCache, InMemoryMetadataIndex, InMemoryStorage};
use mycenae::types::{QueryFilter, QueryPayload, SubQuery};
use mycenae::QueryService;

struct Fixture {
    index: Arc<InMemoryMetadataIndex>,
    storage: Arc<InMemoryStorage>,
    cache: Arc<InMemoryMetadataCache>,
    service: QueryService,
}

fn fixture_with(settings: QuerySettings) -> Fixture {
    let index = Arc::new(InMemoryMetadataIndex::new());
    let storage = Arc::new(InMemoryStorage::new());
    let cache = Arc::new(InMemoryMetadataCache::new());
    let service = QueryService::new(
        &settings,
        index.clone(),
        storage.clone(),
        cache.clone(),
    )
    .unwrap();
    Fixture {
        index,
        storage,
        cache,
        service,
    }
}

fn fixture() -> Fixture {
    fixture_with(QuerySettings::default())
}

fn relative_payload(query: SubQuery) -> QueryPayload {
    QueryPayload {
        relative: "1h-ago".to_string(),
        queries: vec![query],
        ..Default::default()
    }
}

#[tokio::test]
async fn relative_query_with_group_by_splits_per_host() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);
    fx.index.add_series("k1", "cpu", "t-b", &[("host", "b")]);

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        tags: [("host".to_string(), "*".to_string())].into(),
        ..Default::default()
    });

    let outcome = fx.service.query("k1", payload).await.unwrap();
    assert_eq!(outcome.entries.len(), 2);
    assert!(outcome.entries.iter().all(|e| e.metric == "cpu"));
    assert_eq!(outcome.entries[0].tags["host"], "a");
    assert_eq!(outcome.entries[1].tags["host"], "b");
    assert!(outcome.entries.iter().all(|e| e.aggregated_tags.is_empty()));
    assert!(outcome.processed_bytes > 0);

    // each group fetched its own tsuid batch
    let calls = fx.storage.calls();
    assert_eq!(calls.len(), 2);
}

#[tokio::test]
async fn ts_limit_exceeded_aborts_the_query() {
    let settings = QuerySettings {
        max_timeseries: 100,
        log_query_threshold: 10,
        ..Default::default()
    };
    let fx = fixture_with(settings);
    for i in 0..150 {
        let tsuid = format!("t{i}");
        let host = format!("h{i}");
        fx.index
            .add_series("k1", "cpu", &tsuid, &[("host", host.as_str())]);
    }

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        tags: [("host".to_string(), "*".to_string())].into(),
        ..Default::default()
    });

    let err = fx.service.query("k1", payload).await.unwrap_err();
    assert_eq!(err.kind(), "ts-limit-exceeded");
    assert_eq!(err.status_code(), 400);
    assert!(fx.storage.calls().is_empty(), "nothing was dispatched");
}

#[tokio::test]
async fn ttl_filter_selects_bucket_and_is_removed() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        filters: vec![
            QueryFilter::wildcard("ttl", "7", false),
            QueryFilter::wildcard("host", "a", false),
        ],
        ..Default::default()
    });

    let outcome = fx.service.query("k1", payload).await.unwrap();
    assert_eq!(outcome.entries.len(), 1);

    let calls = fx.storage.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].ttl, 7, "ttl bucket from the synthetic filter");
    assert_eq!(calls[0].tsuids, vec!["t-a".to_string()]);
}

#[tokio::test]
async fn default_ttl_applies_without_filter() {
    let settings = QuerySettings {
        default_ttl: 30,
        ..Default::default()
    };
    let fx = fixture_with(settings);
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        ..Default::default()
    });

    fx.service.query("k1", payload).await.unwrap();
    assert_eq!(fx.storage.calls()[0].ttl, 30);
}

#[tokio::test]
async fn millisecond_downsample_keeps_empty_buckets() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);
    fx.storage.push_result(SeriesResult {
        data: vec![
            Point {
                date: 1_000,
                value: 1.5,
                empty: false,
            },
            Point {
                date: 1_500,
                value: 0.0,
                empty: true,
            },
        ],
        total: 2,
        count: 2,
        processed_bytes: 32,
    });

    let payload = QueryPayload {
        relative: "1h-ago".to_string(),
        ms_resolution: true,
        queries: vec![SubQuery {
            metric: "cpu".to_string(),
            aggregator: "avg".to_string(),
            downsample: "500ms-avg-null".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let outcome = fx.service.query("k1", payload).await.unwrap();

    let call = &fx.storage.calls()[0];
    assert!(call.keep_empty, "non-none fill keeps empty buckets");
    assert!(call.ms_resolution);
    assert_eq!(call.opers.downsample.options.value, 500);
    assert_eq!(call.opers.downsample.options.unit, "ms");
    assert_eq!(call.opers.downsample.options.fill, "null");

    let dps = &outcome.entries[0].dps;
    assert_eq!(dps["1000"], serde_json::json!(1.5));
    assert_eq!(dps["1500"], serde_json::Value::Null, "null fill encodes as JSON null");
}

#[tokio::test]
async fn nan_fill_encodes_as_string() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);
    fx.storage.push_result(SeriesResult {
        data: vec![Point {
            date: 2_000,
            value: 0.0,
            empty: true,
        }],
        total: 1,
        count: 1,
        processed_bytes: 16,
    });

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "avg".to_string(),
        downsample: "1m-avg-nan".to_string(),
        ..Default::default()
    });

    let outcome = fx.service.query("k1", payload).await.unwrap();
    // second keying divides by 1000
    assert_eq!(outcome.entries[0].dps["2"], serde_json::json!("NaN"));
}

#[tokio::test]
async fn empty_series_produce_no_entry() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);
    fx.storage.push_result(SeriesResult::default());

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        ..Default::default()
    });

    let outcome = fx.service.query("k1", payload).await.unwrap();
    assert!(outcome.entries.is_empty());
}

#[tokio::test]
async fn aggregated_tags_cover_varying_values() {
    let fx = fixture();
    fx.index
        .add_series("k1", "cpu", "t1", &[("host", "a"), ("core", "0")]);
    fx.index
        .add_series("k1", "cpu", "t2", &[("host", "a"), ("core", "1")]);

    // no group-by: both series merge into one entry
    let payload = QueryPayload {
        relative: "1h-ago".to_string(),
        show_tsuids: true,
        queries: vec![SubQuery {
            metric: "cpu".to_string(),
            aggregator: "sum".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let outcome = fx.service.query("k1", payload).await.unwrap();
    assert_eq!(outcome.entries.len(), 1);
    let entry = &outcome.entries[0];
    assert_eq!(entry.tags["host"], "a");
    assert_eq!(entry.aggregated_tags, vec!["core".to_string()]);
    assert_eq!(
        entry.tsuids.as_ref().unwrap(),
        &vec!["t1".to_string(), "t2".to_string()]
    );
}

#[tokio::test]
async fn absolute_window_validation() {
    let fx = fixture();

    let mut payload = QueryPayload {
        start: 0,
        queries: vec![SubQuery {
            metric: "cpu".to_string(),
            aggregator: "sum".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert_eq!(
        fx.service
            .query("k1", payload.clone())
            .await
            .unwrap_err()
            .kind(),
        "validation"
    );

    payload.start = 2_000;
    payload.end = 1_000;
    assert_eq!(
        fx.service.query("k1", payload).await.unwrap_err().kind(),
        "validation"
    );
}

#[tokio::test]
async fn expand_compiles_sorted_canonical_expressions() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-b", &[("host", "b")]);
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let expressions = fx
        .service
        .expand_expression("k1", "merge(sum, query(cpu, {host=*}, 1h-ago))")
        .await
        .unwrap();

    assert_eq!(
        expressions,
        vec![
            "merge(sum,query(cpu,{host=a},1h-ago))",
            "merge(sum,query(cpu,{host=b},1h-ago))",
        ]
    );
}

#[tokio::test]
async fn expand_for_unknown_keyset_is_not_found() {
    let fx = fixture();
    let err = fx
        .service
        .expand_expression("nope", "merge(sum, query(cpu, null, 1h-ago))")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not-found");
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn parse_with_expand_populates_keyset_cache() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let payloads = fx
        .service
        .parse_expression("merge(sum, query(cpu, {host=*}, 1h-ago))", true, Some("k1"))
        .await
        .unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].queries[0].filters.len(), 1);
    assert!(!payloads[0].queries[0].filters[0].group_by);

    // the keyset check went through the cache
    assert_eq!(
        fx.cache.get("keyset:k1").await.unwrap(),
        Some("1".to_string())
    );
}

#[tokio::test]
async fn parse_without_expand_returns_the_payload() {
    let fx = fixture();
    let payloads = fx
        .service
        .parse_expression("merge(sum, query(cpu, {host=*}, 1h-ago))", false, None)
        .await
        .unwrap();
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].queries[0].filters[0].group_by);
}

#[tokio::test]
async fn compile_rejects_absolute_payloads() {
    let fx = fixture();
    let payload = QueryPayload {
        relative: "1h-ago".to_string(),
        start: 5,
        queries: vec![SubQuery {
            metric: "cpu".to_string(),
            aggregator: "sum".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert_eq!(
        fx.service.compile(&payload).unwrap_err().kind(),
        "validation"
    );
}

#[tokio::test]
async fn check_accepts_and_rejects() {
    let fx = fixture();
    assert!(fx.service.check("merge(sum, query(cpu, null, 1h-ago))").is_ok());
    assert_eq!(
        fx.service.check("").unwrap_err().kind(),
        "empty-expression"
    );
    assert!(fx.service.check("merge(sum, query(cpu, null))").is_err());
}

#[tokio::test]
async fn lookup_returns_descriptors_and_total() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t1", &[("host", "a")]);
    fx.index.add_series("k1", "cpu", "t2", &[("host", "b")]);

    let response = fx.service.lookup("k1", "cpu{host=a}").await.unwrap();
    assert_eq!(response.lookup_type, "LOOKUP");
    assert_eq!(response.metric, "cpu");
    assert_eq!(response.total_results, 1);
    assert_eq!(response.results[0].tsuid, "t1");
}

#[tokio::test]
async fn filter_value_and_rate_reach_storage() {
    let fx = fixture();
    fx.index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "count".to_string(),
        rate: true,
        filter_value: ">=5".to_string(),
        ..Default::default()
    });

    fx.service.query("k1", payload).await.unwrap();

    let opers = &fx.storage.calls()[0].opers;
    assert_eq!(opers.merge, "pnt", "count merges as pnt");
    assert!(opers.rate.enabled);
    assert_eq!(opers.rate.options.counter_max, Some(i64::MAX));
    assert!(opers.filter_value.enabled);
    assert_eq!(opers.filter_value.bool_oper, ">=");
    assert_eq!(opers.filter_value.value, 5.0);
}

#[tokio::test]
async fn query_deadline_aborts_slow_fetches() {
    use async_trait::async_trait;
    use mycenae::storage::{DataOperations, Storage};

    struct SlowStorage;

    #[async_trait]
    impl Storage for SlowStorage {
        async fn get_series(
            &self,
            _ttl: i32,
            _tsuids: Vec<String>,
            _start_ms: i64,
            _end_ms: i64,
            _opers: &DataOperations,
            _ms_resolution: bool,
            _keep_empty: bool,
        ) -> mycenae::Result<SeriesResult> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(SeriesResult::default())
        }
    }

    let index = Arc::new(InMemoryMetadataIndex::new());
    index.add_series("k1", "cpu", "t-a", &[("host", "a")]);

    let settings = QuerySettings {
        query_timeout_ms: 100,
        ..Default::default()
    };
    let service = QueryService::new(
        &settings,
        index,
        Arc::new(SlowStorage),
        Arc::new(InMemoryMetadataCache::new()),
    )
    .unwrap();

    let payload = relative_payload(SubQuery {
        metric: "cpu".to_string(),
        aggregator: "sum".to_string(),
        ..Default::default()
    });

    let err = service.query("k1", payload).await.unwrap_err();
    assert_eq!(err.kind(), "external");
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn init_validation_rejects_bad_limits() {
    let index = Arc::new(InMemoryMetadataIndex::new());
    let storage = Arc::new(InMemoryStorage::new());
    let cache = Arc::new(InMemoryMetadataCache::new());

    let settings = QuerySettings {
        max_concurrent_timeseries: 10,
        max_concurrent_reads: 5,
        ..Default::default()
    };
    let err = QueryService::new(&settings, index, storage, cache).unwrap_err();
    assert_eq!(err.kind(), "init");
}
