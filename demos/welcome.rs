use anvilq::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Prints emails instead of sending them.
struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> AnvilResult<()> {
        println!("📧 Welcome aboard, {}! (sent to {})", first_name, to);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AnvilConfig::development();
    init_logging(&config.logging)?;

    println!("🚀 anvilq in-memory example");

    let mut service = JobService::new(config).await?;
    register_welcome_handler(&mut service, Arc::new(LogMailer))?;

    service.start().await?;
    println!("🔨 Worker pool started");

    let client = service.client();
    let users = [
        ("alice@example.com", "Alice"),
        ("bob@example.com", "Bob"),
        ("charlie@example.com", "Charlie"),
    ];
    for (to, first_name) in users {
        let id = enqueue_welcome_email(
            &client,
            &WelcomeEmailPayload::new(to, first_name),
            EnqueueOptions::default(),
        )
        .await?;
        println!("📥 Task enqueued: {}", id);
    }

    while client.stats().await?.acked < users.len() as u64 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    service.stop().await?;
    println!("✅ All welcome emails sent");
    Ok(())
}
