//! Crate-level error aggregation.
//!
//! Each pipeline stage defines its own `thiserror` error enum close to the
//! code that raises it (see `notice::DeserializeError`, `notice::ClassifyError`,
//! `skymap::SkymapError`, `strategy::StrategyError`, `handler::HandlerError`,
//! `listener::ListenerError`). `SentinelError` is the top-level enum the
//! supervisor and CLI deal with; application code beyond that boundary uses
//! `anyhow::Result`.

use crate::handler::HandlerError;
use crate::listener::ListenerError;
use crate::notice::{ClassifyError, DeserializeError};
use crate::skymap::SkymapError;
use crate::strategy::StrategyError;

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] DeserializeError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Skymap(#[from] SkymapError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal initialization error: {0}")]
    Fatal(String),
}
