//! Fleet scenarios over real sockets: control endpoints, counter tracking
//! and a full balancer shed cycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::head;
use axum::Router;
use tokio::net::TcpStream;

use mycenae::api::{build_router, AppState, PROCESSED_BYTES_HEADER};
use mycenae::config::{QuerySettings, TelnetServerSettings, TelnetSettings};
use mycenae::stubs::{
    InMemoryMetadataCache, InMemoryMetadataIndex, InMemoryStorage, RecordingCollector,
};
use mycenae::telnet::manager::{
    Manager, COUNT_CONNS_PATH, HALT_CONNS_PATH, TOTAL_CONNECTIONS_HEADER,
};
use mycenae::QueryService;

fn manager_with(settings: TelnetSettings) -> (Arc<Manager>, Arc<RecordingCollector>) {
    let collector = RecordingCollector::new();
    let manager = Manager::new(settings, 0, collector.clone()).unwrap();
    (manager, collector)
}

async fn serve_api(manager: Arc<Manager>) -> String {
    let query = Arc::new(
        QueryService::new(
            &QuerySettings::default(),
            Arc::new(InMemoryMetadataIndex::new()),
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryMetadataCache::new()),
        )
        .unwrap(),
    );
    let app = build_router(Arc::new(AppState { query, manager }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", addr.port())
}

/// Minimal fake peer answering the two control HEADs
async fn spawn_peer(count: u32, halts: Arc<AtomicUsize>) -> String {
    let router = Router::new()
        .route(
            COUNT_CONNS_PATH,
            head(move || async move {
                let mut response = StatusCode::OK.into_response();
                response.headers_mut().insert(
                    TOTAL_CONNECTIONS_HEADER,
                    HeaderValue::from_str(&count.to_string()).unwrap(),
                );
                response
            }),
        )
        .route(
            HALT_CONNS_PATH,
            head(move || {
                let halts = halts.clone();
                async move {
                    halts.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn control_endpoints_report_count_and_halt() {
    let (manager, _) = manager_with(TelnetSettings {
        node_name: Some("local".to_string()),
        ..Default::default()
    });
    manager
        .add_server(&TelnetServerSettings {
            name: "tsdb".to_string(),
            listen: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();
    let base = serve_api(manager.clone()).await;
    let client = reqwest::Client::new();

    // count starts at zero
    let response = client
        .head(format!("{base}/node/telnet/connections"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[TOTAL_CONNECTIONS_HEADER],
        HeaderValue::from_static("0")
    );

    // first halt accepted, second reports processing
    let response = client
        .head(format!("{base}/node/telnet/balancing/halt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client
        .head(format!("{base}/node/telnet/balancing/halt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 102);

    manager.shutdown().await;
}

#[tokio::test]
async fn every_response_carries_processed_bytes() {
    let (manager, _) = manager_with(TelnetSettings {
        node_name: Some("local".to_string()),
        ..Default::default()
    });
    let base = serve_api(manager).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{base}/api/query/expression/check?exp=merge(sum,query(cpu,null,1h-ago))"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key(PROCESSED_BYTES_HEADER));

    // errors are JSON with the taxonomy kind
    let response = client
        .get(format!("{base}/api/query/expression/check?exp="))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "empty-expression");
}

#[tokio::test]
async fn telnet_points_reach_the_collector() {
    let (manager, collector) = manager_with(TelnetSettings {
        node_name: Some("local".to_string()),
        ..Default::default()
    });
    manager
        .add_server(&TelnetServerSettings {
            name: "tsdb".to_string(),
            listen: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();

    // announce through the control surface to find the port
    let base = serve_api(manager.clone()).await;
    let client = reqwest::Client::new();

    let addr = manager_server_addr(&manager);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_for(|| manager.connection_count() == 1, "accept").await;

    use tokio::io::AsyncWriteExt;
    stream
        .write_all(b"put os.cpu 1573646073 32.5 host=a\n")
        .await
        .unwrap();
    wait_for(|| !collector.points().is_empty(), "collected point").await;
    assert_eq!(collector.points()[0].metric, "os.cpu");

    // the HTTP counter agrees
    let response = client
        .head(format!("{base}/node/telnet/connections"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()[TOTAL_CONNECTIONS_HEADER],
        HeaderValue::from_static("1")
    );

    drop(stream);
    wait_for(|| manager.connection_count() == 0, "close").await;
    manager.shutdown().await;
}

#[tokio::test]
async fn balancer_sheds_down_to_the_margin() {
    // peers report zero connections; with 6 local connections and a margin
    // of 2 the balancer sheds 4 and then stabilizes
    let halts = Arc::new(AtomicUsize::new(0));
    let peer_a = spawn_peer(0, halts.clone()).await;
    let peer_b = spawn_peer(0, halts.clone()).await;

    let (manager, _) = manager_with(TelnetSettings {
        node_name: Some("local".to_string()),
        nodes: vec![peer_a, peer_b, "local".to_string()],
        // the first tick fires well after the six connects below
        conns_balance_check_interval_ms: 300,
        max_wait_for_drop_conns_interval_ms: 50,
        http_request_timeout_ms: 1_000,
        max_unbalanced_conns_per_node: 2,
        ..Default::default()
    });
    manager
        .add_server(&TelnetServerSettings {
            name: "tsdb".to_string(),
            listen: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();

    let addr = manager_server_addr(&manager);
    let mut clients = Vec::new();
    for _ in 0..6 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for(|| manager.connection_count() == 6, "all accepted").await;

    // avg=0, diff=6, excess=4: the counter settles at the margin
    wait_for(|| manager.connection_count() == 2, "shed to margin").await;
    assert!(halts.load(Ordering::SeqCst) >= 2, "peers were halted");

    // give the balancer another tick: inside the margin nothing moves
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(manager.connection_count(), 2);

    manager.shutdown().await;
}

/// The listen address of the manager's only registered server
fn manager_server_addr(manager: &Manager) -> std::net::SocketAddr {
    manager
        .server_addrs()
        .first()
        .copied()
        .expect("no servers registered")
}
