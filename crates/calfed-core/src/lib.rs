//! # Calfed Core
//!
//! Domain model and pure logic for the calendar federation engine:
//!
//! - Canonical event model and provider delta types
//! - Constraints and cross-account policy edges
//! - Provider event classification (sync-loop guard)
//! - The mirror projection engine
//! - Busy-interval merge and gap computation
//! - Analytics math (availability, load, reputation, drift)
//! - The engine-wide error taxonomy and configuration
//!
//! Everything in this crate is side-effect free; persistence and actors
//! live in `calfed-engine`.

pub mod analytics;
pub mod classify;
pub mod config;
pub mod constraint;
pub mod error;
pub mod event;
pub mod ids;
pub mod interval;
pub mod projection;

pub use classify::{classify, EventClass};
pub use config::EngineConfig;
pub use constraint::{Constraint, ConstraintKind, DetailLevel, PolicyEdge};
pub use error::{EngineError, EngineResult};
pub use event::{
    CanonicalEvent, DeltaSummary, EventSource, EventStatus, ProviderDelta, ProviderEvent,
    Transparency, Visibility,
};
pub use interval::{merge_busy, BusyInterval, FreeInterval};
pub use projection::{project_mirrors, project_trip_mirrors, MirrorPayload, MirrorTarget};

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
