use std::num::NonZeroUsize;

use metrics::counter;
use tracing::{error, info, warn};

use crate::event::{ResumeToken, VersionRecord};
use crate::store::{HistoryStore, ResumeTokenStore};

/// Outcome of a flush. Failures are reported, never raised: the window is reset either way.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub token_saved: bool,
    pub records_written: usize,
    pub records_dropped: usize,
}

/// Version records of one collection waiting to be written, plus the newest
/// resume token seen since the last flush.
pub struct BatchAccumulator {
    collection: String,
    history_collection: String,
    threshold: NonZeroUsize,
    records: Vec<VersionRecord>,
    accepted: usize,
    latest_token: Option<ResumeToken>,
}

impl BatchAccumulator {
    pub fn new(collection: &str, history_suffix: &str, threshold: NonZeroUsize) -> Self {
        Self {
            collection: collection.to_owned(),
            history_collection: format!("{}{}", collection, history_suffix),
            threshold,
            records: Vec::with_capacity(threshold.get()),
            accepted: 0,
            latest_token: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest_token(&self) -> Option<&ResumeToken> {
        self.latest_token.as_ref()
    }

    /// Remember the position of every event pulled, accepted or not.
    pub fn observe(&mut self, token: &ResumeToken) {
        self.latest_token = Some(token.clone());
    }

    /// Buffer the record of an accepted event. Returns true once the flush threshold is reached.
    pub fn push(&mut self, record: VersionRecord) -> bool {
        self.records.push(record);
        self.accepted += 1;
        self.is_due()
    }

    pub fn is_due(&self) -> bool {
        self.accepted >= self.threshold.get()
    }

    /// Drop everything buffered, used when the feed restarts from the persisted token.
    pub fn discard(&mut self) {
        if !self.records.is_empty() {
            warn!(
                collection = %self.collection,
                records = self.records.len(),
                "discarding unflushed records, they will be replayed from the stored token"
            );
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.records = Vec::with_capacity(self.threshold.get());
        self.accepted = 0;
        self.latest_token = None;
    }

    /// Persist the newest token, then the buffered records, then reset the window.
    pub async fn flush(
        &mut self,
        tokens: &dyn ResumeTokenStore,
        history: &dyn HistoryStore,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(token) = self.latest_token.take() else {
            self.reset();
            return report;
        };

        match tokens.save(&self.collection, &token).await {
            Ok(()) => {
                info!(collection = %self.collection, token = %token.to_blob(), "stored resume token");
                report.token_saved = true;
            }
            Err(e) => error!(collection = %self.collection, error = %e, "failed to store resume token"),
        }

        let records = std::mem::take(&mut self.records);
        let count = records.len();
        if records.is_empty() {
            warn!(collection = %self.collection, "no records to store");
        } else {
            match history.insert_many(&self.history_collection, records).await {
                Ok(()) => {
                    counter!("cdc_records_flushed_total", "collection" => self.collection.clone())
                        .increment(count as u64);
                    report.records_written = count;
                }
                Err(e) => {
                    counter!("cdc_records_dropped_total", "collection" => self.collection.clone())
                        .increment(count as u64);
                    error!(
                        collection = %self.collection,
                        history_collection = %self.history_collection,
                        records = count,
                        error = %e,
                        "failed to store version records"
                    );
                    report.records_dropped = count;
                }
            }
        }

        self.reset();
        report
    }
}
