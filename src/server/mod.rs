//! HTTP surface: routing, rate limiting, error rendering and the streaming relay.

mod error;
mod rate_limit;
mod relay;
mod routes;
mod state;

pub use rate_limit::RateLimiter;
pub use routes::create_router;
pub use state::AppState;
