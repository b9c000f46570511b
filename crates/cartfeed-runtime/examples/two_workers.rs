//! Two workers sharing one lease store split a four-partition feed between them.
//!
//! Run with: cargo run -p cartfeed-runtime --example two_workers

use std::sync::Arc;
use std::time::Duration;

use cartfeed_runtime::{
    handler_fn, HandlerError, InMemoryChangeFeed, InMemoryLeaseRepository, ProcessorBuilder,
    ProcessorOptions,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let feed = Arc::new(InMemoryChangeFeed::new(4));
    let leases = Arc::new(InMemoryLeaseRepository::new());
    let options = ProcessorOptions {
        lease_ttl: Duration::from_secs(3),
        renew_interval: Duration::from_secs(1),
        acquire_interval: Duration::from_millis(250),
        feed_poll_delay: Duration::from_millis(100),
        ..ProcessorOptions::default()
    };

    let mut workers = Vec::new();
    for name in ["worker-a", "worker-b"] {
        let handler = handler_fn(move |ctx, batch| async move {
            println!(
                "{name}: partition {} got {} change(s), last seq {:?}",
                ctx.partition_id,
                batch.len(),
                batch.last_seq()
            );
            Ok::<(), HandlerError>(())
        });
        let worker = ProcessorBuilder::new("demo", feed.clone(), Arc::new(handler))
            .with_instance_name(name)
            .with_lease_repository(leases.clone())
            .with_options(options.clone())
            .build()?;
        worker.start().await?;
        workers.push(worker);
    }

    for i in 0..20 {
        feed.upsert(&format!("cart-{i}"), json!({ "id": format!("cart-{i}"), "n": i }))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    for worker in &workers {
        println!(
            "{} owns {:?}",
            worker.instance_name(),
            worker.owned_partitions().await
        );
    }
    for worker in &workers {
        worker.stop().await?;
    }
    Ok(())
}
