//! # vayu-gateway
//!
//! A multi-tenant market-data fan-out gateway. Ingests the Vortex broker's
//! real-time binary tick stream, normalizes it, and delivers per-instrument
//! updates to many authenticated downstream clients over two concurrent
//! WebSocket transports, alongside snapshot REST queries and bulk instrument
//! metadata.
//!
//! ## Architecture
//!
//! ```text
//!   Vortex binary WS ──> upstream::FeedManager ──> ticks channel
//!                                                     │
//!   client subscribe ──> gateway ──> mux ──> upstream  │
//!                           ▲                          ▼
//!                           └───── gateway::rooms  (fan-out)
//! ```
//!
//! Control flow: client handshake → [`policy`] → [`gateway`] session →
//! `subscribe` → [`mux`] (refcount + batch) → [`upstream`] subscribe.
//! Data flow: [`upstream`] ticks → [`gateway::rooms`] → client.

pub mod app;
pub mod audit;
pub mod batcher;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod gateway;
pub mod http;
pub mod kv;
pub mod metrics;
pub mod mux;
pub mod policy;
pub mod registry;
pub mod types;
pub mod upstream;

/// Re-export the application state at crate root for convenience.
pub use app::App;
/// Re-export the error type and Result alias.
pub use error::{GatewayError, Result};
