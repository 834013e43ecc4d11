pub mod event_bus;
pub mod scheduler;
pub mod structured_logging;

pub use event_bus::{EventBus, EventEnvelope, Routed, Topic};
pub use scheduler::{JobHandle, JobId, ScheduledJob, Scheduler};
pub use structured_logging::{init_structured_logging, LoggingConfig, OperationTimer};
