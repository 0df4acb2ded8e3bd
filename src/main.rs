use agv_coordinator::adapters::inbound::DemoOrderFeed;
use agv_coordinator::adapters::outbound::{
    FanoutEventSink, InMemoryStateStore, KafkaEventSink, LoggingEventSink, PostgresStateStore,
};
use agv_coordinator::{Config, EventSink, FleetCoordinator, StateStore};
use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    info!("Starting AGV coordinator ({})", config.coordinator.source);

    let store = build_store(&config).await?;
    let sink = build_sink(&config)?;
    let coordinator = Arc::new(
        FleetCoordinator::bootstrap(&config, store, sink)
            .await
            .context("bootstrapping coordinator")?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let feed = DemoOrderFeed::new(coordinator.world(), config.demo.seed);
    let feed_task = tokio::spawn(feed.run(
        coordinator.clone(),
        config.demo.clone(),
        stopped(stop_rx.clone()),
    ));

    let runner = tokio::spawn(coordinator.clone().run(stopped(stop_rx)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down AGV coordinator");
    let _ = stop_tx.send(true);

    runner.await??;
    feed_task.await?;
    let undelivered = coordinator.pending_events().await;
    if undelivered > 0 {
        tracing::warn!("{} event(s) left undelivered", undelivered);
    }
    Ok(())
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn StateStore>> {
    let agvs = config.provision_fleet()?;
    match &config.postgres {
        Some(pg) => {
            let store = PostgresStateStore::new(pg.clone())
                .await
                .map_err(|e| anyhow!(e))?;
            store
                .provision(&config.layout, &agvs)
                .await
                .map_err(|e| anyhow!(e))?;
            info!("Using PostgreSQL state store at {}:{}", pg.host, pg.port);
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory state store");
            Ok(Arc::new(InMemoryStateStore::with_fleet(config.layout.clone(), agvs)))
        }
    }
}

fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn EventSink>> {
    match &config.kafka {
        Some(kafka) => {
            let relay = KafkaEventSink::new(kafka).map_err(|e| anyhow!(e))?;
            Ok(Arc::new(FanoutEventSink::new(
                Arc::new(relay),
                Some(Arc::new(LoggingEventSink)),
            )))
        }
        None => Ok(Arc::new(LoggingEventSink)),
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
