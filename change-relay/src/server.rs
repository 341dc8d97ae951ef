use std::sync::Arc;

use anyhow::Context;
use health::HealthRegistry;
use mongodb::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::decoder::DecoderRegistry;
use crate::diff::{NoopResolver, UpdateDiffExtractor};
use crate::feed::ChangeFeedSource;
use crate::metrics::{serve as serve_status, setup_status_router};
use crate::mongo::{prepare, MongoChangeFeed, MongoHistoryStore, MongoTokenStore};
use crate::publish::KafkaPublisher;
use crate::router::{PassthroughTransformer, PublishRouter};
use crate::watcher::{CollectionWatcher, WatcherContext};

/// Spawn one watcher per collection and wait until all of them stopped.
pub async fn run_watchers<F: ChangeFeedSource>(
    collections: &[String],
    feed: Arc<F>,
    context: WatcherContext,
    liveness: &HealthRegistry,
    liveness_deadline: time::Duration,
    shutdown: CancellationToken,
) {
    let mut watchers = JoinSet::new();
    for collection in collections {
        let handle = liveness.register(format!("watcher-{}", collection), liveness_deadline);
        let watcher = CollectionWatcher::new(collection, feed.clone(), context.clone(), handle);
        watchers.spawn(watcher.run(shutdown.clone()));
    }

    while let Some(result) = watchers.join_next().await {
        if let Err(e) = result {
            error!("watcher task failed: {}", e);
        }
    }
}

/// Connect to MongoDB and Kafka, then relay every watched collection until `shutdown` is cancelled.
pub async fn serve(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let liveness = HealthRegistry::new("liveness");
    let liveness_deadline = time::Duration::try_from(config.liveness_deadline_ms.0)
        .context("invalid liveness deadline")?;

    let client = Client::with_uri_str(&config.mongodb_uri)
        .await
        .context("failed to create MongoDB client")?;
    let database = client.database(&config.mongodb_database);
    let collections = &config.watched_collections.0;
    prepare(
        &database,
        &config.token_collection,
        collections,
        &config.history_collection_suffix,
    )
    .await
    .context("failed to prepare token and history collections")?;

    let publisher = KafkaPublisher::new(
        &config.kafka,
        liveness.register("rdkafka", liveness_deadline),
    )?;
    let router = PublishRouter::new(
        config.router(),
        Arc::new(PassthroughTransformer),
        Arc::new(publisher.clone()),
    );

    let context = WatcherContext {
        tokens: Arc::new(MongoTokenStore::new(&database, &config.token_collection)),
        history: Arc::new(MongoHistoryStore::new(database.clone())),
        extractor: UpdateDiffExtractor::new(
            config.extractor(),
            DecoderRegistry::new(),
            Arc::new(NoopResolver),
        ),
        router: Arc::new(router),
        history_suffix: config.history_collection_suffix.clone(),
        flush_threshold: config.flush_threshold,
        restart_policy: config.restart_policy(),
        liveness_interval: config.liveness_interval(),
    };

    let status_router =
        setup_status_router(liveness.clone()).context("failed to install metrics recorder")?;
    let bind = config.bind();
    let status_shutdown = shutdown.clone();
    let status = tokio::spawn(async move {
        info!("serving metrics and liveness on {}", bind);
        serve_status(status_router, &bind, status_shutdown.cancelled_owned()).await
    });

    info!(collections = ?collections, "starting change relay");
    run_watchers(
        collections,
        Arc::new(MongoChangeFeed::new(database)),
        context,
        &liveness,
        liveness_deadline,
        shutdown.clone(),
    )
    .await;

    // Watchers only stop on shutdown, the status server follows them
    shutdown.cancel();
    if let Err(e) = publisher.flush() {
        error!("failed to flush pending messages: {}", e);
    }
    status.await?.context("status server failed")?;

    info!("change relay stopped");
    Ok(())
}
