//! Welcome email job.
//!
//! Sends a welcome email to a newly registered user. Delivery itself is
//! left to a [`Mailer`] implementation; mailer errors fail the attempt and
//! are retried by the worker pool.

use crate::core::{JobClient, JobService, TaskContext};
use crate::error::AnvilResult;
use crate::task::{EnqueueOptions, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Task type tag of the welcome email job
pub const TASK_WELCOME: &str = "welcome";

/// Payload of the welcome email job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmailPayload {
    /// Recipient address
    pub to: String,
    /// Recipient first name, used in the greeting
    pub first_name: String,
}

impl WelcomeEmailPayload {
    /// Build a payload.
    pub fn new(to: impl Into<String>, first_name: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            first_name: first_name.into(),
        }
    }
}

/// Email delivery, as seen by the welcome job.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send the welcome email.
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> AnvilResult<()>;
}

async fn handle_welcome_email(
    mailer: &dyn Mailer,
    ctx: &TaskContext,
    payload: WelcomeEmailPayload,
) -> AnvilResult<()> {
    tracing::info!(
        task_type = TASK_WELCOME,
        to = %payload.to,
        task_id = %ctx.task_id,
        attempt = ctx.attempts,
        "Processing welcome email task"
    );

    match mailer
        .send_welcome_email(&payload.to, &payload.first_name)
        .await
    {
        Ok(()) => {
            tracing::info!(
                task_type = TASK_WELCOME,
                to = %payload.to,
                "Successfully sent welcome email"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                task_type = TASK_WELCOME,
                to = %payload.to,
                error = %e,
                "Failed to send welcome email"
            );
            Err(e)
        }
    }
}

/// Register the welcome email handler on `service`.
pub fn register_welcome_handler(
    service: &mut JobService,
    mailer: Arc<dyn Mailer>,
) -> AnvilResult<()> {
    service.register_json(TASK_WELCOME, move |ctx, payload: WelcomeEmailPayload| {
        let mailer = Arc::clone(&mailer);
        async move { handle_welcome_email(mailer.as_ref(), &ctx, payload).await }
    })
}

/// Enqueue a welcome email.
pub async fn enqueue_welcome_email(
    client: &JobClient,
    payload: &WelcomeEmailPayload,
    opts: EnqueueOptions,
) -> AnvilResult<TaskId> {
    client.enqueue_json(TASK_WELCOME, payload, opts).await
}
