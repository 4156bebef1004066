//! Records persisted in the shared store and shapes returned by the API.

pub mod activity;
pub mod session;

pub use activity::{LivenessState, PresenceEntry};
pub use session::{AuthSource, Session, SessionSummary};
