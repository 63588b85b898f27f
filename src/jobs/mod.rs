//! Ready-made jobs built on the anvilq core.

pub mod welcome;

pub use welcome::{
    Mailer, TASK_WELCOME, WelcomeEmailPayload, enqueue_welcome_email, register_welcome_handler,
};
