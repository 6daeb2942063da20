//! Shared primitives for the control plane: typed ids, the money type,
//! a clock abstraction, and the crate-wide error type.
//!
//! Nothing in this crate talks to the network or a store; it exists so
//! that `cp-queue`, `cp-state`, `cp-sandbox`, `cp-billing`, `cp-ot`, and
//! `cp-collab` agree on the same vocabulary without depending on each
//! other.

mod error;
mod ids;
mod money;
mod provider;
mod time;

pub use error::CoreError;
pub use ids::{DocumentId, OrgId, RunId, SandboxId, SubtaskId, UserId};
pub use money::Money;
pub use provider::Provider;
pub use time::Clock;

pub type Result<T> = std::result::Result<T, CoreError>;
