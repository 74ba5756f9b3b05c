//! Error types for Weft.

use std::io;

use thiserror::Error;

use crate::types::{EngineState, IfIndex};

/// Result type alias for Weft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Weft.
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors
    /// A single send or probe on a link failed; retried at most once,
    /// otherwise counted as a drop.
    #[error("transient failure on link {index}: {reason}")]
    Transient { index: IfIndex, reason: String },

    /// The link is Down or Disabled; traffic routes around it until it
    /// recovers, never retried against it.
    #[error("link {0} is unavailable")]
    LinkUnavailable(IfIndex),

    /// No usable link for any routing decision. Surfaced as a status
    /// condition; outbound units are counted as drops, the engine keeps
    /// running.
    #[error("no usable link available")]
    TotalOutage,

    #[error("unknown link index {0}")]
    UnknownLink(IfIndex),

    // Lifecycle errors
    /// The engine could not initialize and entered the Failed state.
    #[error("engine startup failed: {0}")]
    Startup(String),

    #[error("engine is not running (state: {0})")]
    NotRunning(EngineState),

    #[error("engine is already running")]
    AlreadyRunning,

    /// The engine is in the Failed state and must be reset before restart.
    #[error("engine failed and requires reset: {0}")]
    FailedState(String),

    /// A routing invariant was broken mid-operation. Programming bug, not a
    /// runtime condition.
    #[error("invariant violated: {0}")]
    Invariant(String),

    // Adapter boundary errors
    #[error("virtual adapter error: {0}")]
    Adapter(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether one immediate retry on another link is warranted.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Io(_))
    }

    /// Whether the error means a specific link must be routed around.
    pub fn routes_around(&self) -> Option<IfIndex> {
        match self {
            Error::Transient { index, .. } => Some(*index),
            Error::LinkUnavailable(index) | Error::UnknownLink(index) => Some(*index),
            _ => None,
        }
    }

    /// Whether the error reflects a full outage rather than a per-link fault.
    pub fn is_outage(&self) -> bool {
        matches!(self, Error::TotalOutage)
    }
}
