//! Dependency-aware, tenant-scoped admission of feature pipelines.

pub mod dependency;
pub mod limiter;
pub mod scheduler;

pub use dependency::{DependencyGraph, DependencyResolver};
pub use limiter::{Admission, ConcurrencyLimiter, SlotTicket};
pub use scheduler::{Scheduler, TickSummary};
