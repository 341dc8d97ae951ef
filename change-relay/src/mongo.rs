//! MongoDB change streams, token store and history store.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::change_stream::event::{
    ChangeStreamEvent, OperationType, ResumeToken as MongoResumeToken,
};
use mongodb::change_stream::session::SessionChangeStream;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ChangeStreamOptions, CollectionOptions, ReadConcern, ReplaceOptions};
use mongodb::{ClientSession, Collection, Database};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{FeedError, StoreError};
use crate::event::{
    token_key, ChangeEvent, OperationKind, ResumeToken, UpdateDescription, VersionRecord,
};
use crate::feed::ChangeFeedSource;
use crate::store::{HistoryStore, ResumeTokenStore};

const TOKEN_BLOB_FIELD: &str = "tokenBlob";

/// Server error codes meaning the requested resume point cannot be used:
/// ChangeStreamHistoryLost, ChangeStreamFatalError, FailedToParse, BadValue.
const REJECTED_TOKEN_CODES: [i32; 4] = [286, 280, 9, 2];

fn server_code(error: &MongoError) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn relaxed(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

fn to_feed_token(token: &MongoResumeToken) -> Result<ResumeToken, FeedError> {
    bson::to_bson(token)
        .map(|bson| ResumeToken(bson.into_relaxed_extjson()))
        .map_err(|e| FeedError::Read(format!("unreadable resume token: {}", e)))
}

fn from_feed_token(token: &ResumeToken) -> Result<MongoResumeToken, FeedError> {
    let bson = Bson::try_from(token.0.clone())
        .map_err(|e| FeedError::ResumeTokenRejected(e.to_string()))?;
    bson::from_bson(bson).map_err(|e| FeedError::ResumeTokenRejected(e.to_string()))
}

fn operation_kind(operation: OperationType) -> OperationKind {
    match operation {
        OperationType::Insert => OperationKind::Insert,
        OperationType::Update => OperationKind::Update,
        OperationType::Delete => OperationKind::Delete,
        OperationType::Other(name) => OperationKind::Other(name),
        other => OperationKind::Other(format!("{:?}", other).to_lowercase()),
    }
}

fn into_change_event(event: ChangeStreamEvent<Document>) -> Result<ChangeEvent, FeedError> {
    Ok(ChangeEvent {
        operation: operation_kind(event.operation_type),
        document_key: event.document_key.map(relaxed).unwrap_or(Value::Null),
        full_document: event
            .full_document
            .and_then(|document| relaxed(document).as_object().cloned()),
        update_description: event.update_description.map(|description| UpdateDescription {
            updated_fields: relaxed(description.updated_fields)
                .as_object()
                .cloned()
                .unwrap_or_default(),
            removed_fields: description.removed_fields,
        }),
        resume_token: to_feed_token(&event.id)?,
    })
}

/// Change streams over the collections of one database, read with majority read concern.
#[derive(Clone)]
pub struct MongoChangeFeed {
    database: Database,
}

impl MongoChangeFeed {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        let mut options = CollectionOptions::default();
        options.read_concern = Some(ReadConcern::majority());
        self.database.collection_with_options(name, options)
    }
}

#[async_trait]
impl ChangeFeedSource for MongoChangeFeed {
    type Session = ClientSession;
    type Cursor = SessionChangeStream<ChangeStreamEvent<Document>>;

    async fn start_session(&self) -> Result<ClientSession, FeedError> {
        // `Database::client` is crate-private in mongodb 2.x; a collection
        // handle exposes the same underlying client without any I/O.
        self.database
            .collection::<Document>("_")
            .client()
            .start_session(None)
            .await
            .map_err(|e| FeedError::Session(e.to_string()))
    }

    async fn open_cursor(
        &self,
        session: &mut ClientSession,
        collection: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Self::Cursor, FeedError> {
        let mut options = ChangeStreamOptions::default();
        options.resume_after = resume_after.map(from_feed_token).transpose()?;
        let resuming = options.resume_after.is_some();

        self.collection(collection)
            .watch_with_session(Vec::<Document>::new(), options, session)
            .await
            .map_err(|e| match server_code(&e) {
                Some(code) if resuming && REJECTED_TOKEN_CODES.contains(&code) => {
                    FeedError::ResumeTokenRejected(e.to_string())
                }
                _ => FeedError::Cursor {
                    collection: collection.to_owned(),
                    reason: e.to_string(),
                },
            })
    }

    async fn next_event(
        &self,
        session: &mut ClientSession,
        cursor: &mut Self::Cursor,
    ) -> Result<ChangeEvent, FeedError> {
        match cursor.next(session).await {
            Ok(Some(event)) => into_change_event(event),
            Ok(None) => Err(FeedError::Closed),
            Err(e) => Err(FeedError::Read(e.to_string())),
        }
    }

    async fn close_cursor(&self, cursor: Self::Cursor) {
        // Killing the server side cursor happens on drop
        drop(cursor);
    }

    async fn close_session(&self, session: ClientSession) {
        drop(session);
    }
}

fn backend(error: MongoError) -> StoreError {
    StoreError::Backend(error.to_string())
}

/// Token records `{ _id: "<collection>_token", tokenBlob: "<token>" }` in a single collection.
#[derive(Clone)]
pub struct MongoTokenStore {
    tokens: Collection<Document>,
}

impl MongoTokenStore {
    pub fn new(database: &Database, token_collection: &str) -> Self {
        Self {
            tokens: database.collection(token_collection),
        }
    }

    async fn replace(&self, record: Document, key: String) -> Result<(), StoreError> {
        let mut options = ReplaceOptions::default();
        options.upsert = Some(true);
        self.tokens
            .replace_one(doc! { "_id": key }, record, options)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ResumeTokenStore for MongoTokenStore {
    async fn load(&self, collection: &str) -> Result<Option<ResumeToken>, StoreError> {
        let key = token_key(collection);
        let record = self
            .tokens
            .find_one(doc! { "_id": key.as_str() }, None)
            .await
            .map_err(backend)?;

        let Some(blob) = record
            .as_ref()
            .and_then(|record| record.get_str(TOKEN_BLOB_FIELD).ok())
        else {
            debug!(collection = %collection, "no stored resume token");
            return Ok(None);
        };

        ResumeToken::from_blob(blob)
            .map(Some)
            .map_err(|error| StoreError::MalformedToken {
                collection: collection.to_owned(),
                error,
            })
    }

    async fn save(&self, collection: &str, token: &ResumeToken) -> Result<(), StoreError> {
        let key = token_key(collection);
        self.replace(doc! { "_id": key.as_str(), TOKEN_BLOB_FIELD: token.to_blob() }, key)
            .await
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        let key = token_key(collection);
        self.replace(doc! { "_id": key.as_str() }, key).await
    }
}

/// Appends version records to `<collection><suffix>` collections, restoring native BSON types.
#[derive(Clone)]
pub struct MongoHistoryStore {
    database: Database,
}

impl MongoHistoryStore {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

fn to_document(record: &VersionRecord) -> Result<Document, StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Encode(e.to_string()))?;
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(StoreError::Encode(format!(
            "record encoded as {:?}",
            other.element_type()
        ))),
        Err(e) => Err(StoreError::Encode(e.to_string())),
    }
}

/// Encode every record that converts to BSON. A record that does not is logged,
/// counted as dropped and left out, so it cannot take the rest of the batch with it.
fn encode_records(history_collection: &str, records: &[VersionRecord]) -> Vec<Document> {
    records
        .iter()
        .filter_map(|record| match to_document(record) {
            Ok(document) => Some(document),
            Err(e) => {
                error!(
                    collection = %history_collection,
                    document_key = %record.document_key,
                    error = %e,
                    "dropping version record that cannot be stored"
                );
                counter!("cdc_records_unencodable_total", "collection" => history_collection.to_owned())
                    .increment(1);
                None
            }
        })
        .collect()
}

#[async_trait]
impl HistoryStore for MongoHistoryStore {
    async fn insert_many(
        &self,
        history_collection: &str,
        records: Vec<VersionRecord>,
    ) -> Result<(), StoreError> {
        let documents = encode_records(history_collection, &records);
        if documents.is_empty() {
            return Ok(());
        }

        self.database
            .collection::<Document>(history_collection)
            .insert_many(documents, None)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// Create the token collection and missing history collections, and seed an empty
/// token record for every watched collection that has none.
pub async fn prepare(
    database: &Database,
    token_collection: &str,
    collections: &[String],
    history_suffix: &str,
) -> Result<(), MongoError> {
    let existing = database.list_collection_names(None).await?;

    let wanted = std::iter::once(token_collection.to_owned()).chain(
        collections
            .iter()
            .map(|collection| format!("{}{}", collection, history_suffix)),
    );
    for name in wanted {
        if !existing.contains(&name) {
            info!(collection = %name, "creating collection");
            database.create_collection(&name, None).await?;
        }
    }

    let tokens = database.collection::<Document>(token_collection);
    for collection in collections {
        let key = token_key(collection);
        if tokens.find_one(doc! { "_id": key.as_str() }, None).await?.is_none() {
            tokens.insert_one(doc! { "_id": key.as_str() }, None).await?;
            info!(collection = %collection, "seeded empty resume token record");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_restore_native_types() {
        let fields = json!({
            "modifiedDateTime": {"$date": {"$numberLong": "1597043200000"}},
            "count": {"$numberLong": "12"},
            "name": "tee",
        });
        let record = VersionRecord::updated(
            json!({"_id": {"$oid": "5f2f6c3e9b1d4c0012345678"}}),
            fields.as_object().cloned().unwrap(),
            vec!["size".to_string()],
        );

        let document = to_document(&record).unwrap();
        let updated = document.get_document("updatedFields").unwrap();
        assert!(matches!(updated.get("modifiedDateTime"), Some(Bson::DateTime(_))));
        assert_eq!(updated.get("count"), Some(&Bson::Int64(12)));
        assert!(matches!(
            document.get_document("documentKey").unwrap().get("_id"),
            Some(Bson::ObjectId(_))
        ));
        assert_eq!(document.get_array("removedFields").unwrap().len(), 1);
        assert!(!document.contains_key("insertedFields"));
    }

    #[test]
    fn unencodable_records_do_not_sink_the_batch() {
        let fields = |value: Value| value.as_object().cloned().unwrap();
        let records = vec![
            VersionRecord::updated(json!({"_id": 1}), fields(json!({"size": "M"})), vec![]),
            VersionRecord::updated(
                json!({"_id": 2}),
                fields(json!({"modifiedDateTime": {"$date": "garbage"}})),
                vec![],
            ),
            VersionRecord::updated(json!({"_id": 3}), fields(json!({"size": "L"})), vec![]),
        ];
        assert!(to_document(&records[1]).is_err());

        let documents = encode_records("sku_coll", &records);
        let keys: Vec<&Document> = documents
            .iter()
            .map(|document| document.get_document("documentKey").unwrap())
            .collect();
        assert_eq!(keys, vec![&doc! { "_id": 1 }, &doc! { "_id": 3 }]);
    }

    #[test]
    fn unsupported_operations_keep_their_name() {
        assert_eq!(operation_kind(OperationType::Insert), OperationKind::Insert);
        assert_eq!(
            operation_kind(OperationType::Replace),
            OperationKind::Other("replace".to_string())
        );
        assert_eq!(
            operation_kind(OperationType::Other("shardCollection".to_string())),
            OperationKind::Other("shardCollection".to_string())
        );
    }

    #[test]
    fn documents_become_relaxed_extended_json() {
        let converted = relaxed(doc! {
            "_id": 7_i64,
            "price": 12.5,
            "at": bson::DateTime::from_millis(1597043200000),
            "tags": ["a", "b"],
        });

        assert_eq!(
            converted,
            json!({
                "_id": 7,
                "price": 12.5,
                "at": {"$date": "2020-08-10T07:06:40Z"},
                "tags": ["a", "b"],
            })
        );
    }
}
