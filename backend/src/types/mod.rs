pub mod id;

pub use id::{SessionId, SubjectId};
