use async_trait::async_trait;

use crate::error::FeedError;
use crate::event::{ChangeEvent, ResumeToken};

/// A source of per-collection change events.
///
/// A watcher holds at most one session and one cursor at a time. Sessions and
/// cursors are owned values so the watcher decides when they are released,
/// including on error paths.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync + 'static {
    type Session: Send + 'static;
    type Cursor: Send + 'static;

    async fn start_session(&self) -> Result<Self::Session, FeedError>;

    /// Open a cursor on `collection`, resuming strictly after `resume_after` when given,
    /// or at the current feed position otherwise.
    ///
    /// Must fail with [`FeedError::ResumeTokenRejected`] when the token is not usable.
    async fn open_cursor(
        &self,
        session: &mut Self::Session,
        collection: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Cursor, FeedError>;

    /// Wait for the next event. Only dropped before completion on shutdown.
    async fn next_event(
        &self,
        session: &mut Self::Session,
        cursor: &mut Self::Cursor,
    ) -> Result<ChangeEvent, FeedError>;

    async fn close_cursor(&self, cursor: Self::Cursor);

    async fn close_session(&self, session: Self::Session);
}
