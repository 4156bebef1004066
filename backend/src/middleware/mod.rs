pub mod auth;
pub mod csrf;
pub mod logging;
pub mod rate_limit;
pub mod request_id;

pub use auth::{auth, AuthenticatedSession};
pub use csrf::csrf_guard;
pub use logging::log_error_responses;
pub use rate_limit::rate_limit;
pub use request_id::{request_id, RequestId};
