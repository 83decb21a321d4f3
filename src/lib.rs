//! alert-sentinel: transient-alert ingestion and sky-tiling sentinel.
//!
//! Listens for gravitational-wave, gamma-ray burst and neutrino transient
//! notices over a streaming broker or the legacy VOEvent Transport
//! Protocol, classifies and deduplicates them, resolves an observing
//! strategy, and materializes a tiled observing plan against the sky
//! region each notice's skymap covers.
//!
//! ## Pipeline
//!
//! - [`listener`]: transport-agnostic message ingestion (streaming broker
//!   or legacy socket) plus the heartbeat monitor.
//! - [`notice`]: payload deserialization and per-source classification into
//!   a tagged [`notice::Notice`].
//! - [`skymap`]: skymap acquisition (embedded, downloaded, or synthesized)
//!   and querying.
//! - [`strategy`]: the static observing-strategy catalog and cadence
//!   expansion.
//! - [`grid`]: the sky tessellation tile selection runs against.
//! - [`db`]: the alert and observation database collaborators.
//! - [`handler`]: the core per-notice decision pipeline tying the above
//!   together.
//! - [`dispatcher`]: the single consumer draining the notice queue.
//! - [`notify`]: Slack report composition.
//! - [`sentinel`]: the supervisor wiring listener, heartbeat and dispatcher
//!   into one running process.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod grid;
pub mod handler;
pub mod listener;
pub mod notice;
pub mod notify;
pub mod sentinel;
pub mod skymap;
pub mod strategy;

pub use error::SentinelError;
