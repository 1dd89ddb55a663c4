//! Rate limiting logic and state management.

mod backend;
mod clock;
mod fixed_window;
mod limiter;
mod sliding_window;
mod store;

pub use backend::{Decision, RateLimiterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed_window::{FixedWindowLimiter, FixedWindowRecord};
pub use limiter::{Algorithm, RateLimiter};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowRecord};
pub use store::{ExpiringStore, Stats, SweeperHandle};
