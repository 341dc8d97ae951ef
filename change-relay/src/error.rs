use thiserror::Error;

/// Errors raised by a change feed while acquiring or reading from it.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("feed refused the resume token: {0}")]
    ResumeTokenRejected(String),
    #[error("failed to start a feed session: {0}")]
    Session(String),
    #[error("failed to open a cursor on {collection}: {reason}")]
    Cursor { collection: String, reason: String },
    #[error("change feed read failed: {0}")]
    Read(String),
    #[error("change feed was closed by the source")]
    Closed,
}

/// Errors raised by the token and history stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("stored resume token for {collection} is malformed: {error}")]
    MalformedToken {
        collection: String,
        error: serde_json::Error,
    },
    #[error("history record could not be encoded: {0}")]
    Encode(String),
    #[error("store operation failed: {0}")]
    Backend(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Syntax(String),
    #[error("expected a document, found {0}")]
    NotADocument(&'static str),
    #[error("not valid extended JSON: {0}")]
    Invalid(String),
    #[error("document does not match the registered model: {0}")]
    Model(String),
}

#[derive(Error, Debug)]
#[error("failed to resolve composite key {key}: {reason}")]
pub struct ResolveError {
    pub key: String,
    pub reason: String,
}

#[derive(Error, Debug)]
#[error("failed to transform {collection} payload: {reason}")]
pub struct TransformError {
    pub collection: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to enqueue message for {topic}: {reason}")]
    Enqueue { topic: String, reason: String },
}

/// Errors building an outbound payload. All of them are logged and dropped by the router.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("dimension entry is missing {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Errors that send a watcher through its restart path.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
