//! Core data model for cellwatch.
//!
//! These types describe what the agent sees and remembers:
//! cell candidates from the attachment source, fixes from the fix source,
//! the observations written to the log, and the persisted heartbeat.

mod cell;
mod fix;
mod heartbeat;
mod observation;

pub use cell::{CellCandidate, primary};
pub use fix::{Fix, FixFailure, FixOrigin};
pub use heartbeat::HeartbeatState;
pub use observation::{LifecycleEvent, Observation, ObservationKind, ObservationSource};
