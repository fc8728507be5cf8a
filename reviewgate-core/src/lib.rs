//! Core logic for reviewgate: the data model, policy resolution and merge
//! gate evaluation. Nothing here performs I/O beyond reading a policy file.

pub mod gate;
pub mod model;
pub mod policy;
pub mod recording;

pub use gate::{evaluate, GateDecision, GateInput, Unsatisfied};
pub use model::*;
pub use policy::{PolicyError, PolicyHandle, PolicySet, Resolution, ResolutionRequest};
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, Sanitizer, CORRELATION_ID_HEADER,
};
