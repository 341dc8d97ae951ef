use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchAccumulator;
use crate::classify::{classify, Classification};
use crate::diff::UpdateDiffExtractor;
use crate::error::{FeedError, StoreError, WatchError};
use crate::event::ChangeEvent;
use crate::feed::ChangeFeedSource;
use crate::retry::RetryPolicy;
use crate::router::PublishRouter;
use crate::store::{HistoryStore, ResumeTokenStore};

const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(1);

/// Everything a watcher shares with the other watchers of the process.
#[derive(Clone)]
pub struct WatcherContext {
    pub tokens: Arc<dyn ResumeTokenStore>,
    pub history: Arc<dyn HistoryStore>,
    pub extractor: UpdateDiffExtractor,
    pub router: Arc<PublishRouter>,
    pub history_suffix: String,
    pub flush_threshold: NonZeroUsize,
    pub restart_policy: RetryPolicy,
    /// How often liveness is reported while waiting for events.
    pub liveness_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    NoSession,
    NoCursor,
    Streaming,
    Error,
}

enum Pulled {
    Event(ChangeEvent),
    Failed(FeedError),
    Cancelled,
}

/// Streams the change feed of one collection into its history store and downstream topics.
pub struct CollectionWatcher<F: ChangeFeedSource> {
    collection: String,
    feed: Arc<F>,
    context: WatcherContext,
    window: BatchAccumulator,
    liveness: HealthHandle,
}

impl<F: ChangeFeedSource> CollectionWatcher<F> {
    pub fn new(
        collection: &str,
        feed: Arc<F>,
        context: WatcherContext,
        liveness: HealthHandle,
    ) -> Self {
        let window = BatchAccumulator::new(
            collection,
            &context.history_suffix,
            context.flush_threshold,
        );
        Self {
            collection: collection.to_owned(),
            feed,
            context,
            window,
            liveness,
        }
    }

    /// Drive the feed until `shutdown` is cancelled. Errors restart the feed, they never end the loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(collection = %self.collection, "starting change feed watcher");

        let mut session: Option<F::Session> = None;
        let mut cursor: Option<F::Cursor> = None;
        let mut restarts: u32 = 0;
        let mut state = WatcherState::NoSession;

        while !shutdown.is_cancelled() {
            // Only the first attempt and a live cursor count as healthy after a failure
            if restarts == 0 {
                self.liveness.report_healthy();
            }
            debug!(collection = %self.collection, state = ?state, "watcher transition");

            state = match state {
                WatcherState::NoSession => match self.feed.start_session().await {
                    Ok(started) => {
                        session = Some(started);
                        WatcherState::NoCursor
                    }
                    Err(e) => {
                        error!(collection = %self.collection, error = %e, "failed to start feed session");
                        WatcherState::Error
                    }
                },
                WatcherState::NoCursor => match session.as_mut() {
                    None => WatcherState::NoSession,
                    Some(active) => match self.open_cursor(active).await {
                        Ok(opened) => {
                            cursor = Some(opened);
                            info!(collection = %self.collection, "change feed cursor open");
                            WatcherState::Streaming
                        }
                        Err(e) => {
                            error!(collection = %self.collection, error = %e, "failed to open change feed cursor");
                            WatcherState::Error
                        }
                    },
                },
                WatcherState::Streaming => match (session.as_mut(), cursor.as_mut()) {
                    (Some(active), Some(open)) => {
                        match self.pull(active, open, &shutdown).await {
                            Pulled::Event(event) => {
                                self.handle(event).await;
                                restarts = 0;
                                WatcherState::Streaming
                            }
                            Pulled::Failed(e) => {
                                error!(collection = %self.collection, error = %e, "change feed read failed");
                                WatcherState::Error
                            }
                            Pulled::Cancelled => break,
                        }
                    }
                    _ => WatcherState::Error,
                },
                WatcherState::Error => {
                    self.release(&mut session, &mut cursor).await;
                    self.window.discard();
                    counter!("cdc_watcher_restarts_total", "collection" => self.collection.clone())
                        .increment(1);

                    let backoff = self.context.restart_policy.time_until_next_retry(restarts);
                    restarts = restarts.saturating_add(1);
                    self.liveness.report_unhealthy(format!(
                        "change feed restarting, attempt {}",
                        restarts
                    ));
                    warn!(
                        collection = %self.collection,
                        backoff_ms = backoff.as_millis() as u64,
                        "restarting change feed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => WatcherState::NoSession,
                    }
                }
            };
        }

        self.release(&mut session, &mut cursor).await;
        info!(collection = %self.collection, "change feed watcher stopped");
    }

    /// Open a cursor after the stored token, falling back to the current position
    /// when there is no usable token.
    async fn open_cursor(&self, session: &mut F::Session) -> Result<F::Cursor, WatchError> {
        let stored = match self.context.tokens.load(&self.collection).await {
            Ok(stored) => stored,
            Err(e @ StoreError::MalformedToken { .. }) => {
                self.reject_token(&e.to_string()).await?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        let Some(token) = stored else {
            return Ok(self.feed.open_cursor(session, &self.collection, None).await?);
        };

        match self
            .feed
            .open_cursor(session, &self.collection, Some(&token))
            .await
        {
            Ok(opened) => {
                info!(collection = %self.collection, token = %token.to_blob(), "resuming change feed");
                Ok(opened)
            }
            Err(FeedError::ResumeTokenRejected(reason)) => {
                self.reject_token(&reason).await?;
                Ok(self.feed.open_cursor(session, &self.collection, None).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reject_token(&self, reason: &str) -> Result<(), WatchError> {
        error!(
            collection = %self.collection,
            reason = %reason,
            "resume token rejected, clearing it and reading from the current position"
        );
        counter!("cdc_token_rejections_total", "collection" => self.collection.clone())
            .increment(1);
        self.context.tokens.clear(&self.collection).await?;
        Ok(())
    }

    /// Wait for the next event, reporting liveness while the feed is quiet.
    async fn pull(
        &self,
        session: &mut F::Session,
        cursor: &mut F::Cursor,
        shutdown: &CancellationToken,
    ) -> Pulled {
        let next = self.feed.next_event(session, cursor);
        tokio::pin!(next);
        let mut heartbeat =
            tokio::time::interval(self.context.liveness_interval.max(MIN_LIVENESS_INTERVAL));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Pulled::Cancelled,
                result = &mut next => {
                    return match result {
                        Ok(event) => Pulled::Event(event),
                        Err(e) => Pulled::Failed(e),
                    }
                }
                _ = heartbeat.tick() => self.liveness.report_healthy(),
            }
        }
    }

    async fn handle(&mut self, event: ChangeEvent) {
        self.window.observe(&event.resume_token);

        let classification = classify(&event);
        counter!(
            "cdc_events_total",
            "collection" => self.collection.clone(),
            "kind" => classification.label()
        )
        .increment(1);

        let extracted = match classification {
            Classification::Insert(document) => {
                self.context
                    .extractor
                    .extract_insert(&self.collection, &event, document)
            }
            Classification::Update(diff) => {
                self.context
                    .extractor
                    .extract_update(&self.collection, &event, diff)
                    .await
            }
            Classification::Skip(reason) => {
                counter!("cdc_events_skipped_total", "collection" => self.collection.clone())
                    .increment(1);
                error!(collection = %self.collection, reason = %reason, "skipping change event");
                return;
            }
            Classification::Delete => {
                warn!(
                    collection = %self.collection,
                    document_key = %event.document_key,
                    "delete events are not recorded"
                );
                return;
            }
            Classification::Unsupported(reason) => {
                warn!(collection = %self.collection, reason = %reason, "ignoring change event");
                return;
            }
        };

        let accepted = match extracted {
            Ok(accepted) => accepted,
            Err(reason) => {
                counter!("cdc_events_skipped_total", "collection" => self.collection.clone())
                    .increment(1);
                error!(
                    collection = %self.collection,
                    document_key = %event.document_key,
                    error = %reason,
                    "skipping change event"
                );
                return;
            }
        };

        let due = self.window.push(accepted.record.clone());
        self.context.router.dispatch(&self.collection, &accepted).await;

        if due {
            let report = self
                .window
                .flush(
                    self.context.tokens.as_ref(),
                    self.context.history.as_ref(),
                )
                .await;
            debug!(collection = %self.collection, report = ?report, "flushed batch window");
        }
    }

    async fn release(&self, session: &mut Option<F::Session>, cursor: &mut Option<F::Cursor>) {
        if let Some(open) = cursor.take() {
            self.feed.close_cursor(open).await;
        }
        if let Some(active) = session.take() {
            self.feed.close_session(active).await;
        }
    }
}
