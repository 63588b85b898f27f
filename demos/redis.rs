use anvilq::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct HelloTask {
    name: String,
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AnvilConfig::development();
    config.broker = BrokerConfig::redis("redis://localhost:6379")
        .with_retry_policy(RetryPolicy::exponential(3));
    config.workers = config.workers.with_queues(vec![
        QueueSpec::new("critical", 6),
        QueueSpec::new("default", 3),
        QueueSpec::new("low", 1),
    ]);
    init_logging(&config.logging)?;

    println!("🚀 anvilq Redis example");

    let broker = BrokerFactory::from_config(config.broker.clone()).await?;
    let purged = broker.purge().await?;
    println!("🧹 Purged {} existing tasks from Redis", purged);

    let mut service = JobService::with_broker(config, broker)?;
    service.register_json("hello", |ctx, task: HelloTask| async move {
        println!("👋 Hello {}: {} (attempt {})", task.name, task.message, ctx.attempts);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    })?;

    service.start().await?;
    println!("🔨 Worker pool started, press Ctrl+C to stop");

    let greetings = [
        ("Alice", "Hello from Wonderland!", "critical"),
        ("Bob", "Greetings from the Builder!", "default"),
        ("Charlie", "Salutations from the Chocolate Factory!", "low"),
        ("Dave", "Hey there from the Data Center!", "default"),
    ];
    for (name, message, queue) in greetings {
        let task = HelloTask {
            name: name.to_string(),
            message: message.to_string(),
        };
        service
            .enqueue_json("hello", &task, EnqueueOptions::queue(queue))
            .await?;
        println!("📥 Task enqueued on {}: {}", queue, name);
    }

    tokio::signal::ctrl_c().await?;

    service.stop().await?;
    if let Some(report) = service.shutdown_report().await {
        println!("🛑 Stopped in {:?}, {} tasks abandoned", report.elapsed, report.abandoned);
    }
    Ok(())
}
