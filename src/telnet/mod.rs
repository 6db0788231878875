//! Telnet ingestion
//!
//! Line-protocol TCP servers ([`server`]) coordinated by a fleet manager
//! ([`manager`]) that balances connection load across peer nodes. Parsed
//! points are forwarded to an external [`Collector`].

pub mod manager;
pub mod server;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// One parsed telnet point
#[derive(Debug, Clone, PartialEq)]
pub struct TelnetPoint {
    /// Metric name
    pub metric: String,
    /// Point timestamp, seconds or milliseconds since the epoch
    pub timestamp: i64,
    /// Point value
    pub value: f64,
    /// Tag set, at least one entry
    pub tags: BTreeMap<String, String>,
}

/// Downstream consumer of parsed points
#[async_trait]
pub trait Collector: Send + Sync {
    /// Take ownership of one point
    async fn handle_point(&self, point: TelnetPoint) -> Result<()>;
}

/// Parse an OpenTSDB telnet frame:
/// `put <metric> <timestamp> <value> <tagk=tagv> [<tagk=tagv>…]`
pub fn parse_put_line(line: &str) -> Result<TelnetPoint> {
    let mut parts = line.split_whitespace();

    match parts.next() {
        Some("put") => {}
        _ => return Err(Error::validation(format!("not a put frame: {line}"))),
    }

    let metric = parts
        .next()
        .ok_or_else(|| Error::validation("put frame missing metric"))?;
    let timestamp: i64 = parts
        .next()
        .ok_or_else(|| Error::validation("put frame missing timestamp"))?
        .parse()
        .map_err(|_| Error::validation("put frame has invalid timestamp"))?;
    let value: f64 = parts
        .next()
        .ok_or_else(|| Error::validation("put frame missing value"))?
        .parse()
        .map_err(|_| Error::validation("put frame has invalid value"))?;

    let mut tags = BTreeMap::new();
    for pair in parts {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| Error::validation(format!("invalid tag pair: {pair}")))?;
        if k.is_empty() || v.is_empty() {
            return Err(Error::validation(format!("invalid tag pair: {pair}")));
        }
        tags.insert(k.to_string(), v.to_string());
    }
    if tags.is_empty() {
        return Err(Error::validation("put frame needs at least one tag"));
    }

    Ok(TelnetPoint {
        metric: metric.to_string(),
        timestamp,
        value,
        tags,
    })
}

/// Bounded FIFO queue of unit close tokens.
///
/// The manager pushes one token per connection it wants closed; any
/// connection task may consume one and terminate itself. Built from a pair
/// of semaphores: `slots` bounds the queue, `tokens` carries the pending
/// requests.
pub struct CloseRequests {
    slots: Arc<Semaphore>,
    tokens: Arc<Semaphore>,
    capacity: usize,
}

impl CloseRequests {
    /// Create a queue holding at most `capacity` pending tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            tokens: Arc::new(Semaphore::new(0)),
            capacity,
        }
    }

    /// Enqueue one token, waiting while the queue is full
    pub async fn push(&self) {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .expect("close queue slots closed")
            .forget();
        self.tokens.add_permits(1);
    }

    /// Wait for a token and consume it
    pub async fn wait(&self) {
        self.tokens
            .clone()
            .acquire_owned()
            .await
            .expect("close queue tokens closed")
            .forget();
        self.slots.add_permits(1);
    }

    /// Consume every pending token without waiting; returns how many
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while let Ok(permit) = self.tokens.try_acquire() {
            permit.forget();
            self.slots.add_permits(1);
            drained += 1;
        }
        drained
    }

    /// Tokens currently waiting for a consumer
    pub fn pending(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
