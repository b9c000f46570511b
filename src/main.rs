use std::sync::Arc;
use std::time::Duration;

use cartfeed::settings::AppSettings;
use cartfeed::simulator::{demo_buyers, simulate_shoppers};
use cartfeed::{AbandonedCartHandler, AbandonedCartView, InMemoryBuyerDirectory};
use cartfeed_runtime::{InMemoryChangeFeed, ProcessorBuilder, StopHandle};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "appSettings.json".to_string());
    let settings = AppSettings::load(&path)?;
    let leases = settings.open_lease_store()?;

    let feed = Arc::new(InMemoryChangeFeed::new(settings.partitions));
    let directory = Arc::new(InMemoryBuyerDirectory::new());
    let buyers = demo_buyers();
    for buyer in &buyers {
        directory.insert(buyer.clone())?;
    }
    let view = Arc::new(AbandonedCartView::new());
    let handler = AbandonedCartHandler::new(directory, view.clone())
        .with_slow_request_threshold(settings.slow_request_threshold());

    let mut builder =
        ProcessorBuilder::new(&settings.processor_name, feed.clone(), Arc::new(handler))
            .with_lease_repository(leases)
            .with_options(settings.processor.clone())
            .start_from(settings.start_from());
    if let Some(instance_name) = &settings.instance_name {
        builder = builder.with_instance_name(instance_name.as_str());
    }
    let processor = builder.build()?;

    info!("Starting Change Feed Processor...");
    processor.start().await?;
    info!(
        "Change Feed Processor {} started as {}.",
        processor.processor_name(),
        processor.instance_name()
    );

    let shoppers = StopHandle::new();
    let traffic = tokio::spawn(simulate_shoppers(
        feed,
        buyers,
        Duration::from_millis(500),
        shoppers.signal(),
    ));

    println!("Press Ctrl+C to exit..");
    tokio::signal::ctrl_c().await?;

    shoppers.stop();
    match traffic.await {
        Ok(Ok(carts)) => info!("simulated {carts} cart(s)"),
        Ok(Err(err)) => error!("shopper simulation failed: {err}"),
        Err(err) => error!("shopper simulation panicked: {err}"),
    }
    for halted in processor.halted_partitions().await {
        error!(
            "partition {} halted: {}",
            halted.partition_id, halted.error
        );
    }
    processor.stop().await?;

    for cart in view.abandoned_carts().await {
        println!(
            "abandoned cart {} of {} ({})",
            cart.cart_id,
            cart.buyer_name.as_deref().unwrap_or(&cart.buyer_id),
            cart.contact_number.as_deref().unwrap_or("no contact number")
        );
    }
    Ok(())
}
