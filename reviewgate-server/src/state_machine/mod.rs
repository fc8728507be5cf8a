//! Assignment tracker as an explicit state machine.
//!
//! - **State**: what is known about a PR (`TrackedPullRequest`)
//! - **Events**: what happened (`Event`)
//! - **Effects**: what to do (`Effect`)
//! - **Transition**: pure `(state, event) -> (state, effects)`
//!
//! The interpreter executes effects; the store serializes events per PR and
//! persists state through a `StateRepository`.

pub mod effect;
pub mod event;
pub mod interpreter;
pub mod repository;
pub mod state;
pub mod store;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use state::*;
pub use store::StateStore;
pub use transition::*;
