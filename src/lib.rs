//! # Weft
//!
//! Multi-path traffic management: one virtual endpoint woven across every
//! physical link a machine has.
//!
//! Weft pins each traffic flow to a physical interface chosen by a routing
//! policy, keeps the pins sticky while the interface stays healthy, and moves
//! them within a bounded window when it does not.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Virtual Adapter                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Engine (hot path + lifecycle)                  │
//! │   ┌────────────┐   ┌───────────────┐   ┌─────────────────┐      │
//! │   │ Flow Table │──▶│ Policy Engine │──▶│ Health Snapshot │      │
//! │   └────────────┘   └───────────────┘   └─────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Prober / Registry / Discovery                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Link 1 (wired)   Link 2 (wireless)   Link 3 (cellular)  ...    │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Numeric literals are clear
#![allow(clippy::cast_possible_truncation)]  // Intentional score calculations
#![allow(clippy::cast_sign_loss)]            // Scores are always positive
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::cast_possible_wrap)]        // Intentional for sequence arithmetic
#![allow(clippy::suboptimal_flops)]          // Clarity over micro-optimization
#![allow(clippy::similar_names)]             // state/stats are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod policy;
pub mod probe;
pub mod registry;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use engine::{Engine, EngineEvent, EngineStats, EngineStatus, StopOutcome};
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Smallest MTU the virtual adapter accepts.
pub const MIN_MTU: u16 = 576;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapter::{LinkProvider, LinkTransport, VirtualAdapter};
    pub use crate::config::Config;
    pub use crate::engine::{Engine, EngineEvent, EngineStats, EngineStatus, StopOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::flow::{FlowKey, ServiceClass};
    pub use crate::policy::{PolicyMode, RouteReason};
    pub use crate::registry::{HealthSnapshot, LinkEntry, LinkRegistry};
    pub use crate::types::*;
}
