pub mod auth;
pub mod governor_rate_limiter;
pub mod middleware;
pub mod origin;
pub mod rate_limiter;
pub mod sanitizer;

pub use auth::{AuthError, AuthService};
pub use governor_rate_limiter::AuthThrottle;
pub use origin::OriginKeyGenerator;
