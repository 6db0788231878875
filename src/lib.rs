//! Mycenae - time-series metrics platform
//!
//! This crate implements the two coordination-heavy subsystems of the
//! platform:
//!
//! - An OpenTSDB-compatible query service: expression parsing, group-by
//!   expansion against a metadata index, bounded-concurrency execution
//!   against a column store, and response materialization.
//! - A telnet ingest fleet manager: one or more line-protocol TCP servers
//!   sharing a process-wide connection counter, plus a balancer loop that
//!   sheds excess connections in coordination with peer nodes.
//!
//! Storage, the metadata index, the metadata cache, and the point collector
//! are external collaborators expressed as traits (see [`storage`],
//! [`metadata`] and [`telnet`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod error;
pub mod metadata;
pub mod query;
pub mod storage;
pub mod stubs;
pub mod telnet;
pub mod types;

// Re-export main types
pub use error::{Error, Result};
pub use query::QueryService;
pub use telnet::manager::Manager;
