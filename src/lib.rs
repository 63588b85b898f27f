//! # anvilq
//!
//! A lease-based background task queue for Rust applications.
//!
//! ## Features
//!
//! - **Weighted Queues**: Busy queues are served in proportion to their weight
//! - **At-Least-Once Delivery**: Leases expire, so a crashed worker's tasks come back
//! - **Retries and Dead Letters**: Exponential backoff, then a dead-letter set
//! - **Graceful Shutdown**: In-flight tasks finish within a bounded window
//! - **Observability**: Structured logging, task lifecycle events and optional Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ResizeImage {
//!     path: String,
//!     width: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let config = AnvilConfig::development();
//!     init_logging(&config.logging)?;
//!
//!     let mut service = JobService::new(config).await?;
//!     service.register_json("resize", |ctx, job: ResizeImage| async move {
//!         tracing::info!(task_id = %ctx.task_id, "Resizing {} to {}px", job.path, job.width);
//!         Ok(())
//!     })?;
//!
//!     service.start().await?;
//!     service
//!         .enqueue_json(
//!             "resize",
//!             &ResizeImage { path: "cat.png".into(), width: 640 },
//!             EnqueueOptions::queue("default"),
//!         )
//!         .await?;
//!
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod task;
pub mod utils;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::broker::{
        Broker, BrokerFactory, BrokerStats, InMemoryBroker, Lease, LeaseHandle, RequeueOutcome,
        SharedBroker,
    };
    pub use crate::config::*;
    pub use crate::core::{
        HandlerRegistry, JobClient, JobService, PoolStats, ServiceState, ShutdownReport,
        TaskContext, TaskHandler, WeightedScheduler, WorkerPool,
    };
    pub use crate::error::{AnvilError, AnvilResult};
    pub use crate::events::{
        ChannelTracer, CompositeTracer, LogTracer, TaskEvent, TaskEventKind, Tracer,
    };
    pub use crate::jobs::{
        Mailer, TASK_WELCOME, WelcomeEmailPayload, enqueue_welcome_email, register_welcome_handler,
    };
    pub use crate::logging::init_logging;
    pub use crate::task::{EnqueueOptions, Task, TaskId, TaskState};
    pub use async_trait::async_trait;

    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    pub use crate::broker::RedisBroker;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::AnvilMetrics;
}

pub use crate::broker::{Broker, InMemoryBroker, SharedBroker};
pub use crate::config::*;
pub use crate::core::{JobClient, JobService, TaskContext, TaskHandler};
pub use crate::error::{AnvilError, AnvilResult};
pub use crate::logging::init_logging;
pub use crate::task::{EnqueueOptions, Task, TaskId, TaskState};
pub use async_trait::async_trait;
