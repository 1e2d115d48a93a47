//! crew daemon - hook ingestion pipeline, session registry and broadcast server
//!
//! - `registry` - the actor owning sessions, teams and timers
//! - `queue` - append-only NDJSON file transport
//! - `http` - direct-call transport and dashboard API
//! - `server` - Unix socket fan-out to delta consumers
//! - `monitor` - process liveness and agent PID lookup
//! - `terminal` - terminal directory seam and its in-process implementation
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐ ┌───────────┐ ┌───────────┐
//! │ HTTP API  │ │ file queue│ │  socket   │   hook payloads
//! └─────┬─────┘ └─────┬─────┘ └─────┬─────┘
//!       └─────────────┼─────────────┘
//!                     ▼
//!           ┌───────────────────┐     ┌──────────────────┐
//!           │   RegistryActor   │────▶│ ProcessProbe /   │
//!           │ validate, resolve │     │ TerminalDirectory│
//!           │ apply, publish    │     └──────────────────┘
//!           └─────────┬─────────┘
//!                     │ ReplayEntry (seq, delta)
//!                     ▼
//!           ┌───────────────────┐
//!           │ per-consumer      │
//!           │ bounded queues    │
//!           └───────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod config;
pub mod http;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod replay;
pub mod server;
pub mod stats;
pub mod teams;
pub mod terminal;
