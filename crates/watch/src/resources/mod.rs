//! Admission control: rate limiting, the priority queue and the resource
//! manager that drives them.

pub mod manager;
pub mod queue;
pub mod rate_limiter;
pub mod usage;

pub use manager::{ResourceManager, ResourceManagerBuilder};
pub use queue::{OperationId, OperationQueue, PendingOperation, QueuedOperation};
pub use rate_limiter::RateLimiter;
pub use usage::{QueueStatistics, ResourceUsage, ResourceUsageTracker};
