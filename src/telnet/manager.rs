//! Telnet fleet manager
//!
//! One manager per process owns the shared connection counter and the
//! close-token queue, registers telnet servers and runs the connection
//! balancer. Each balancer tick polls peer connection counts over HTTP;
//! when the local node holds more than the peer average plus the configured
//! hysteresis, the excess is shed: peers are told to halt their own
//! balancing, close tokens are queued, and new accepts are denied until the
//! drop window passes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{TelnetServerSettings, TelnetSettings};
use crate::error::{Error, Result};

use super::server::TelnetServer;
use super::{CloseRequests, Collector};

/// Header carrying a node's connection count
pub const TOTAL_CONNECTIONS_HEADER: &str = "X-Total-Connections";

/// Control path peers are asked for their connection count on
pub const COUNT_CONNS_PATH: &str = "/node/telnet/connections";

/// Control path peers are told to halt balancing on
pub const HALT_CONNS_PATH: &str = "/node/telnet/balancing/halt";

/// The telnet fleet manager
pub struct Manager {
    settings: TelnetSettings,
    http_port: u16,
    collector: Arc<dyn Collector>,
    shared_counter: Arc<AtomicU32>,
    halt_balancing: AtomicBool,
    close_requests: Arc<CloseRequests>,
    servers: RwLock<Vec<Arc<TelnetServer>>>,
    peers: Vec<String>,
    http_client: reqwest::Client,
    terminate: AtomicBool,
    balancer_started: AtomicBool,
}

impl Manager {
    /// Create a manager. The node's own name is removed from the configured
    /// node list; whatever remains are the balancing peers.
    pub fn new(
        settings: TelnetSettings,
        http_port: u16,
        collector: Arc<dyn Collector>,
    ) -> Result<Arc<Self>> {
        let node_name = settings.node_name();
        let peers: Vec<String> = settings
            .nodes
            .iter()
            .filter(|node| **node != node_name)
            .cloned()
            .collect();

        let http_client = reqwest::Client::builder()
            .timeout(settings.http_request_timeout())
            .build()
            .map_err(|e| Error::init(format!("cannot build peer http client: {e}")))?;

        let close_requests = Arc::new(CloseRequests::new(settings.close_channel_size));

        Ok(Arc::new(Self {
            settings,
            http_port,
            collector,
            shared_counter: Arc::new(AtomicU32::new(0)),
            halt_balancing: AtomicBool::new(false),
            close_requests,
            servers: RwLock::new(Vec::new()),
            peers,
            http_client,
            terminate: AtomicBool::new(false),
            balancer_started: AtomicBool::new(false),
        }))
    }

    /// Bind and register a new telnet server. The balancer starts with the
    /// first registration and runs until process termination.
    pub async fn add_server(self: &Arc<Self>, server_settings: &TelnetServerSettings) -> Result<()> {
        let server = TelnetServer::bind(
            server_settings,
            self.shared_counter.clone(),
            self.settings.max_connections,
            self.close_requests.clone(),
            self.collector.clone(),
        )
        .await?;

        info!(server = %server.name(), "server created and listening");
        self.servers.write().push(server);

        if !self.balancer_started.swap(true, Ordering::SeqCst) {
            let manager = self.clone();
            tokio::spawn(manager.run_balancer());
        }

        Ok(())
    }

    /// Connections currently accepted across all servers
    pub fn connection_count(&self) -> u32 {
        self.shared_counter.load(Ordering::SeqCst)
    }

    /// Listen addresses of the registered servers, in registration order.
    /// Useful when servers were bound to port zero.
    pub fn server_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.servers.read().iter().map(|s| s.local_addr()).collect()
    }

    /// Handle a peer's halt notification. Returns true when the flag was
    /// unset (the peer gets 200), false when the node was already halted
    /// (102 Processing).
    pub fn halt(&self) -> bool {
        !self.halt_balancing.swap(true, Ordering::SeqCst)
    }

    /// Shut every server down and stop the balancer at its next tick
    pub async fn shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        let servers: Vec<_> = self.servers.read().clone();
        for server in servers {
            server.shutdown().await;
        }
        if !self.servers.read().is_empty() {
            info!("all telnet servers were shut down");
        }
    }

    async fn run_balancer(self: Arc<Self>) {
        info!("starting the connection balance checks");

        loop {
            tokio::time::sleep(self.settings.balance_check_interval()).await;

            if self.terminate.load(Ordering::SeqCst) {
                info!("terminating the connection balance check");
                return;
            }

            if self.peers.is_empty() {
                info!("there are no other nodes to balance connections against");
                return;
            }

            self.balance_tick().await;
        }
    }

    /// One balancer pass: poll peers, decide, shed
    pub(crate) async fn balance_tick(&self) {
        let counts = futures::future::join_all(
            self.peers.iter().map(|node| self.peer_connection_count(node)),
        )
        .await;

        let local = self.connection_count();

        for (node, count) in self.peers.iter().zip(&counts) {
            if *count > local {
                info!(node = %node, count, local, "another node holds more connections");
                return;
            }
        }

        let Some(excess) = shed_excess(
            local,
            &counts,
            self.settings.max_unbalanced_conns_per_node,
        ) else {
            return;
        };

        if !self.shed(excess).await {
            tokio::time::sleep(self.settings.wait_for_other_node_balancing()).await;

            if self
                .halt_balancing
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                info!("resuming the balancing process");
            } else {
                warn!("balancing process is already running, something went wrong");
            }
        }
    }

    /// Drop `excess` connections: halt peers, queue close tokens, deny new
    /// accepts for the drop window, then reopen. Returns false when this
    /// node is itself halted and nothing was shed.
    pub(crate) async fn shed(&self, excess: u32) -> bool {
        if self.halt_balancing.load(Ordering::SeqCst) {
            info!("telnet balancing process is halted, waiting");
            return false;
        }

        info!("halting connection balancing on other nodes");
        self.halt_peers().await;

        info!(excess, "number of telnet connections exceeded");

        for _ in 0..excess {
            debug!("adding to close connection channel");
            self.close_requests.push().await;
        }

        let servers: Vec<_> = self.servers.read().clone();
        for server in &servers {
            info!(server = %server.name(), "halting new connections");
            server.deny_new_connections(true);
        }

        info!(
            wait = ?self.settings.wait_for_drop_interval(),
            "waiting for connections to drop"
        );
        tokio::time::sleep(self.settings.wait_for_drop_interval()).await;

        let drained = self.close_requests.drain();
        if drained > 0 {
            debug!(drained, "close connection channel drained");
        }

        for server in &servers {
            info!(server = %server.name(), "accepting new connections again");
            server.deny_new_connections(false);
        }

        true
    }

    /// HEAD a peer for its connection count; failures count as zero
    async fn peer_connection_count(&self, node: &str) -> u32 {
        let url = self.peer_url(node, COUNT_CONNS_PATH);
        debug!(node = %node, "asking node for its number of connections");

        let response = match self.http_client.head(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(node = %node, error = %e, "peer count request failed");
                return 0;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            error!(node = %node, status = %response.status(), "unexpected peer count status");
            return 0;
        }

        let count = response
            .headers()
            .get(TOTAL_CONNECTIONS_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u32>().ok());

        match count {
            Some(count) => {
                debug!(node = %node, count, "peer connection count");
                count
            }
            None => {
                error!(node = %node, "missing or invalid total connections header");
                0
            }
        }
    }

    /// Tell every peer to halt its balancing for the drop window
    async fn halt_peers(&self) {
        for node in &self.peers {
            info!(node = %node, "notifying node to halt the balancing process");
            let url = self.peer_url(node, HALT_CONNS_PATH);

            let response = match self.http_client.head(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    error!(node = %node, error = %e, "peer halt request failed");
                    continue;
                }
            };

            match response.status() {
                reqwest::StatusCode::PROCESSING => {
                    info!(node = %node, "node is already halting the balancing process");
                }
                reqwest::StatusCode::OK => {
                    info!(node = %node, "node was notified to halt the balancing");
                }
                status => {
                    error!(node = %node, status = %status, "error asking node to halt");
                }
            }
        }
    }

    /// Peer control URL. Nodes may carry an explicit `host:port`, otherwise
    /// the configured HTTP port is used.
    fn peer_url(&self, node: &str, path: &str) -> String {
        if node.contains(':') {
            format!("http://{node}{path}")
        } else {
            format!("http://{}:{}{}", node, self.http_port, path)
        }
    }

    #[cfg(test)]
    pub(crate) fn set_connection_count(&self, count: u32) {
        self.shared_counter.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn close_requests(&self) -> &CloseRequests {
        &self.close_requests
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> Vec<Arc<TelnetServer>> {
        self.servers.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn is_halted(&self) -> bool {
        self.halt_balancing.load(Ordering::SeqCst)
    }
}

/// How many connections to shed, if any: local must exceed the ceiling
/// average of the peer counts by at least the hysteresis margin, and the
/// margin itself is never shed
fn shed_excess(local: u32, peer_counts: &[u32], max_unbalanced: u32) -> Option<u32> {
    if peer_counts.is_empty() {
        return None;
    }

    let sum: u32 = peer_counts.iter().sum();
    let peers = peer_counts.len() as u32;
    let average = sum.div_ceil(peers);

    if local <= average {
        return None;
    }
    let diff = local - average;
    if diff < max_unbalanced {
        return None;
    }

    let excess = diff - max_unbalanced;
    if excess == 0 {
        None
    } else {
        Some(excess)
    }
}
