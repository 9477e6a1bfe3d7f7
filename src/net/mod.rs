//! Network layer: pacing, circuit breaking, retries, and the HTTP executor.
//!
//! Policy order for every outbound request: circuit breaker, then pacing
//! gate, then the timed request itself, then retry handling. Terminal
//! failures feed back into the breaker; downloaded bytes feed the budget
//! accountant.

pub mod breaker;
pub mod error;
pub mod executor;
pub mod pacer;
pub mod retry;

pub use breaker::{BreakerMode, BreakerSnapshot, CircuitBreaker};
pub use error::FetchError;
pub use executor::{HttpExecutor, default_user_agent};
pub use pacer::{Pacer, parse_retry_after};
pub use retry::{FailureClass, RetryPolicy, classify_status};
