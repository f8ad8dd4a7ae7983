//! # labrelay: Experiment Orchestration with Live Log Streaming
//!
//! labrelay launches long-running experiment jobs, tracks their lifecycle,
//! and streams their execution logs to any number of observers in near real
//! time.
//!
//! ## Components
//!
//! - [`validate`]: schema name validator guarding every partition identifier
//! - [`experiment`]: lifecycle records and the process-wide registry
//! - [`logs`]: partitioned append-only log stores and the tail reader
//! - [`runner`]: supervised background execution of an external engine
//! - [`stream`]: per-observer stream sessions
//! - [`client`]: reconnecting, deduplicating observer; the network
//!   transport needs feature `client`
//! - [`orchestrator`]: one facade over all of the above
//! - `server`: HTTP/WebSocket surface (feature `server`)
//!
//! ## Guarantees
//!
//! - Status only moves `pending -> running -> {completed | failed}`
//! - A stream session never delivers an entry at or before its cursor, and
//!   delivers every entry after it in timestamp order
//! - Engine faults become a `failed` status; they never crash the process
//!
//! ## Example
//!
//! ```rust
//! use labrelay::validate::validate_schema_name;
//!
//! assert!(validate_schema_name("marketplace_10_5_1234567890"));
//! assert!(!validate_schema_name("test-experiment"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod config;
pub mod error;
pub mod experiment;
pub mod logs;
pub mod orchestrator;
pub mod runner;
#[cfg(feature = "server")]
pub mod server;
pub mod stream;
pub mod validate;

pub use error::{Error, Result};
