//! Telnet line-protocol server
//!
//! Accepts TCP connections, reads newline-delimited `put` frames and
//! forwards parsed points to the collector. Each accepted connection
//! increments the fleet-wide connection counter; the manager controls the
//! server through the `deny_new` flag and the shared close-token queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TelnetServerSettings;
use crate::error::{Error, Result};

use super::{parse_put_line, CloseRequests, Collector};

/// One telnet listener
pub struct TelnetServer {
    name: String,
    local_addr: SocketAddr,
    deny_new: Arc<AtomicBool>,
    active_conns: Arc<AtomicU32>,
    malformed_frames: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TelnetServer {
    /// Bind the listener and start its accept loop
    pub async fn bind(
        settings: &TelnetServerSettings,
        shared_counter: Arc<AtomicU32>,
        max_connections: u32,
        close_requests: Arc<CloseRequests>,
        collector: Arc<dyn Collector>,
    ) -> Result<Arc<Self>> {
        let addr: SocketAddr = settings
            .listen
            .parse()
            .map_err(|_| Error::init(format!("invalid telnet listen address: {}", settings.listen)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::init(format!("cannot bind telnet server {}: {e}", settings.name)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::init(format!("cannot resolve local address: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        let server = Arc::new(Self {
            name: settings.name.clone(),
            local_addr,
            deny_new: Arc::new(AtomicBool::new(false)),
            active_conns: Arc::new(AtomicU32::new(0)),
            malformed_frames: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        });

        info!(server = %server.name, addr = %local_addr, "telnet server listening");

        tokio::spawn(server.clone().accept_loop(
            listener,
            shared_counter,
            max_connections,
            close_requests,
            collector,
        ));

        Ok(server)
    }

    /// Server name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// When set, newly accepted connections are closed immediately
    pub fn deny_new_connections(&self, deny: bool) {
        self.deny_new.store(deny, Ordering::SeqCst);
    }

    /// Whether new connections are being denied
    pub fn is_denying_new(&self) -> bool {
        self.deny_new.load(Ordering::SeqCst)
    }

    /// Connections currently handled by this server
    pub fn active_connections(&self) -> u32 {
        self.active_conns.load(Ordering::SeqCst)
    }

    /// Frames dropped as unparseable since startup
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Stop accepting, terminate active connections and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        while self.active_conns.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!(server = %self.name, "telnet server shut down");
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        shared_counter: Arc<AtomicU32>,
        max_connections: u32,
        close_requests: Arc<CloseRequests>,
        collector: Arc<dyn Collector>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(server = %self.name, "telnet accept loop terminating");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(server = %self.name, error = %e, "accept error");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    };

                    if self.deny_new.load(Ordering::SeqCst) {
                        debug!(server = %self.name, peer = %peer, "connection denied, balancing in progress");
                        continue;
                    }

                    if shared_counter.load(Ordering::SeqCst) >= max_connections {
                        warn!(server = %self.name, peer = %peer, max_connections, "connection limit reached");
                        continue;
                    }

                    shared_counter.fetch_add(1, Ordering::SeqCst);
                    self.active_conns.fetch_add(1, Ordering::SeqCst);

                    let server = self.clone();
                    let counter = shared_counter.clone();
                    let closes = close_requests.clone();
                    let sink = collector.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer, closes, sink).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                        server.active_conns.fetch_sub(1, Ordering::SeqCst);
                        debug!(server = %server.name, peer = %peer, "connection closed");
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        close_requests: Arc<CloseRequests>,
        collector: Arc<dyn Collector>,
    ) {
        debug!(server = %self.name, peer = %peer, "connection accepted");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = close_requests.wait() => {
                    info!(server = %self.name, peer = %peer, "connection dropped by balancer");
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match parse_put_line(&line) {
                                Ok(point) => {
                                    if let Err(e) = collector.handle_point(point).await {
                                        warn!(server = %self.name, error = %e, "collector rejected point");
                                    }
                                }
                                Err(e) => {
                                    self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                    debug!(server = %self.name, peer = %peer, error = %e, "dropped malformed frame");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(server = %self.name, peer = %peer, error = %e, "read error");
                            break;
                        }
                    }
                }
            }
        }
    }
}
