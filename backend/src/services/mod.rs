pub mod activity;
pub mod csrf;
pub mod identity;
pub mod rate_limit;
pub mod session_store;

pub use activity::{ActivitySweeper, ActivityTracker};
pub use csrf::{CsrfError, CsrfTokenManager};
pub use identity::{IdentityError, IdentityProvider, PlatformLogin};
pub use rate_limit::{RateLimitKey, RateLimitResult, RateLimiter};
pub use session_store::SessionStore;
