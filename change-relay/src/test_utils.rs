//! In-memory doubles for the feed, the resolver, the transformer and the publisher.
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use crate::diff::EntityResolver;
use crate::error::{FeedError, PublishError, ResolveError, TransformError};
use crate::event::{ChangeEvent, OperationKind, ResumeToken, UpdateDescription};
use crate::feed::ChangeFeedSource;
use crate::publish::Publisher;
use crate::router::PayloadTransformer;

/// Token for the event at `position` in a [`MemoryChangeFeed`] log.
pub fn memory_token(position: u64) -> ResumeToken {
    ResumeToken(json!({ "_data": format!("{:016x}", position) }))
}

fn token_position(token: &ResumeToken) -> Option<u64> {
    token
        .0
        .get("_data")
        .and_then(Value::as_str)
        .and_then(|data| u64::from_str_radix(data, 16).ok())
}

#[derive(Default)]
struct CollectionLog {
    events: Vec<ChangeEvent>,
    /// Tokens for positions below this are rejected on open.
    oldest_resumable: u64,
    failing_reads: usize,
    opens: Vec<Option<ResumeToken>>,
}

#[derive(Default)]
struct FeedState {
    logs: HashMap<String, CollectionLog>,
    failing_sessions: usize,
    sessions_started: u64,
    sessions_closed: u64,
    cursors_closed: u64,
}

/// Append-only, per-collection change log with resume token semantics.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    state: Arc<Mutex<FeedState>>,
    appended: Arc<Notify>,
}

pub struct MemorySession {
    pub id: u64,
}

pub struct MemoryCursor {
    collection: String,
    position: u64,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<R>(&self, collection: &str, f: impl FnOnce(&mut CollectionLog) -> R) -> R {
        let mut state = self.state.lock().expect("poisoned feed state");
        f(state.logs.entry(collection.to_owned()).or_default())
    }

    /// Append an event, assigning it the next token of the collection log.
    pub fn push(
        &self,
        collection: &str,
        operation: OperationKind,
        document_key: Value,
        full_document: Option<Value>,
        update_description: Option<UpdateDescription>,
    ) -> ResumeToken {
        let token = self.with_log(collection, |log| {
            let token = memory_token(log.events.len() as u64);
            log.events.push(ChangeEvent {
                operation,
                document_key,
                full_document: full_document.and_then(|d| d.as_object().cloned()),
                update_description,
                resume_token: token.clone(),
            });
            token
        });
        self.appended.notify_waiters();
        token
    }

    pub fn push_insert(&self, collection: &str, id: u64, document: Value) -> ResumeToken {
        self.push(
            collection,
            OperationKind::Insert,
            json!({ "_id": id }),
            Some(document),
            None,
        )
    }

    pub fn push_update(
        &self,
        collection: &str,
        id: u64,
        updated_fields: Value,
        removed_fields: &[&str],
    ) -> ResumeToken {
        let description = UpdateDescription {
            updated_fields: updated_fields.as_object().cloned().unwrap_or_default(),
            removed_fields: removed_fields.iter().map(|f| f.to_string()).collect(),
        };
        self.push(
            collection,
            OperationKind::Update,
            json!({ "_id": id }),
            None,
            Some(description),
        )
    }

    pub fn push_update_without_description(&self, collection: &str, id: u64) -> ResumeToken {
        self.push(collection, OperationKind::Update, json!({ "_id": id }), None, None)
    }

    pub fn push_delete(&self, collection: &str, id: u64) -> ResumeToken {
        self.push(collection, OperationKind::Delete, json!({ "_id": id }), None, None)
    }

    pub fn push_other(&self, collection: &str, operation: &str) -> ResumeToken {
        self.push(
            collection,
            OperationKind::Other(operation.to_owned()),
            Value::Null,
            None,
            None,
        )
    }

    /// Make tokens older than `position` unusable, as if the oplog rolled over.
    pub fn expire_before(&self, collection: &str, position: u64) {
        self.with_log(collection, |log| log.oldest_resumable = position);
    }

    /// Fail the next `count` reads on `collection`.
    pub fn fail_reads(&self, collection: &str, count: usize) {
        self.with_log(collection, |log| log.failing_reads = count);
        self.appended.notify_waiters();
    }

    /// Fail the next `count` session starts.
    pub fn fail_sessions(&self, count: usize) {
        self.state.lock().expect("poisoned feed state").failing_sessions = count;
    }

    /// The resume token passed to every cursor opened on `collection`, in order.
    pub fn opens(&self, collection: &str) -> Vec<Option<ResumeToken>> {
        self.with_log(collection, |log| log.opens.clone())
    }

    pub fn sessions_started(&self) -> u64 {
        self.state.lock().expect("poisoned feed state").sessions_started
    }

    pub fn sessions_closed(&self) -> u64 {
        self.state.lock().expect("poisoned feed state").sessions_closed
    }

    pub fn cursors_closed(&self) -> u64 {
        self.state.lock().expect("poisoned feed state").cursors_closed
    }

    fn poll(&self, cursor: &mut MemoryCursor) -> Option<Result<ChangeEvent, FeedError>> {
        self.with_log(&cursor.collection, |log| {
            if log.failing_reads > 0 {
                log.failing_reads -= 1;
                return Some(Err(FeedError::Read("injected read failure".to_string())));
            }
            let event = log.events.get(cursor.position as usize).cloned()?;
            cursor.position += 1;
            Some(Ok(event))
        })
    }
}

#[async_trait]
impl ChangeFeedSource for MemoryChangeFeed {
    type Session = MemorySession;
    type Cursor = MemoryCursor;

    async fn start_session(&self) -> Result<MemorySession, FeedError> {
        let mut state = self.state.lock().expect("poisoned feed state");
        if state.failing_sessions > 0 {
            state.failing_sessions -= 1;
            return Err(FeedError::Session("injected session failure".to_string()));
        }
        state.sessions_started += 1;
        Ok(MemorySession {
            id: state.sessions_started,
        })
    }

    async fn open_cursor(
        &self,
        _session: &mut MemorySession,
        collection: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<MemoryCursor, FeedError> {
        self.with_log(collection, |log| {
            log.opens.push(resume_after.cloned());
            let position = match resume_after {
                None => log.events.len() as u64,
                Some(token) => match token_position(token) {
                    Some(position) if position >= log.oldest_resumable => position + 1,
                    _ => {
                        return Err(FeedError::ResumeTokenRejected(format!(
                            "token {} is no longer in the log",
                            token.to_blob()
                        )))
                    }
                },
            };
            Ok(MemoryCursor {
                collection: collection.to_owned(),
                position,
            })
        })
    }

    async fn next_event(
        &self,
        _session: &mut MemorySession,
        cursor: &mut MemoryCursor,
    ) -> Result<ChangeEvent, FeedError> {
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(result) = self.poll(cursor) {
                return result;
            }
            appended.await;
        }
    }

    async fn close_cursor(&self, _cursor: MemoryCursor) {
        self.state.lock().expect("poisoned feed state").cursors_closed += 1;
    }

    async fn close_session(&self, _session: MemorySession) {
        self.state.lock().expect("poisoned feed state").sessions_closed += 1;
    }
}

/// Resolver answering from a fixed table, recording every lookup.
#[derive(Clone, Default)]
pub struct StaticResolver {
    entities: HashMap<Vec<String>, Value>,
    fail: bool,
    lookups: Arc<Mutex<Vec<Vec<String>>>>,
}

impl StaticResolver {
    pub fn with(mut self, parts: &[&str], entity: Value) -> Self {
        self.entities
            .insert(parts.iter().map(|p| p.to_string()).collect(), entity);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> Vec<Vec<String>> {
        self.lookups.lock().expect("poisoned lookups").clone()
    }
}

#[async_trait]
impl EntityResolver for StaticResolver {
    async fn resolve(&self, parts: &[&str]) -> Result<Option<Value>, ResolveError> {
        let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        self.lookups
            .lock()
            .expect("poisoned lookups")
            .push(parts.clone());
        if self.fail {
            return Err(ResolveError {
                key: parts.join("-"),
                reason: "lookup source unavailable".to_string(),
            });
        }
        Ok(self.entities.get(&parts).cloned())
    }
}

pub struct FailingTransformer;

impl PayloadTransformer for FailingTransformer {
    fn transform(&self, collection: &str, _: &Map<String, Value>) -> Result<Value, TransformError> {
        Err(TransformError {
            collection: collection.to_owned(),
            reason: "no mapping".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    published: Arc<AtomicU64>,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().expect("poisoned messages").clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError> {
        self.messages
            .lock()
            .expect("poisoned messages")
            .push(PublishedMessage {
                topic: topic.to_owned(),
                key: key.map(str::to_owned),
                payload,
            });
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
