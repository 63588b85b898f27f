//! Task processing core: scheduling, dispatch, the worker pool and the
//! job service that ties them together.

pub mod client;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use client::JobClient;
pub use registry::{HandlerRegistry, TaskContext, TaskHandler};
pub use scheduler::WeightedScheduler;
pub use service::{JobService, ServiceState};
pub use worker::{PoolStats, ShutdownReport, WorkerPool};
