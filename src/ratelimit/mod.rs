//! Rate limiting logic and policy resolution.

mod clock;
mod key;
mod limiter;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::CounterKey;
pub use limiter::{RateLimitResult, RateLimiter, RateLimiterBuilder, Rejection};
pub use policy::{PolicyCatalog, RateLimitConfig};
