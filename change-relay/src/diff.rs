use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decoder::{reformat_legacy, DecoderRegistry};
use crate::error::{DecodeError, ResolveError};
use crate::event::{ChangeEvent, UpdateDescription, VersionRecord};

/// Looks up the business entity referenced by a composite identifier.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// `parts` is the identifier split on the configured delimiter.
    /// `Ok(None)` means nothing is known for the identifier.
    async fn resolve(&self, parts: &[&str]) -> Result<Option<Value>, ResolveError>;
}

/// Resolver for deployments without a cross-reference source: every lookup comes back empty.
pub struct NoopResolver;

#[async_trait]
impl EntityResolver for NoopResolver {
    async fn resolve(&self, _parts: &[&str]) -> Result<Option<Value>, ResolveError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedKind {
    Insert,
    Update,
}

/// An event that produced a version record, with what downstream publishing needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub kind: AcceptedKind,
    pub record: VersionRecord,
    /// Full document for inserts, assembled updated fields for updates.
    pub payload: Map<String, Value>,
    /// Update touching the package shipping dimension list of the dimension collection.
    pub psd: bool,
}

/// Why an event produced no record. Always logged, never fatal.
#[derive(Error, Debug, PartialEq)]
pub enum SkipReason {
    #[error("document could not be parsed: {0}")]
    Unparseable(DecodeError),
    #[error("document key could not be parsed: {0}")]
    InvalidDocumentKey(DecodeError),
    #[error("{0}")]
    Unresolved(String),
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Substring identifying composite identifier fields in an update diff.
    pub composite_key_marker: String,
    pub composite_key_delimiter: String,
    /// Collection whose updates can carry package shipping dimensions.
    pub dimension_collection: String,
    pub dimension_field: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            composite_key_marker: "csId".to_string(),
            composite_key_delimiter: "-".to_string(),
            dimension_collection: "sku".to_string(),
            dimension_field: DIMENSION_FIELD.to_string(),
        }
    }
}

pub const DIMENSION_FIELD: &str = "skuPackageShippingDimensionList";

/// Turns insert and update events into version records.
#[derive(Clone)]
pub struct UpdateDiffExtractor {
    config: ExtractorConfig,
    decoders: DecoderRegistry,
    resolver: Arc<dyn EntityResolver>,
}

impl UpdateDiffExtractor {
    pub fn new(
        config: ExtractorConfig,
        decoders: DecoderRegistry,
        resolver: Arc<dyn EntityResolver>,
    ) -> Self {
        Self {
            config,
            decoders,
            resolver,
        }
    }

    pub fn is_psd(&self, collection: &str, diff: &Map<String, Value>) -> bool {
        collection.eq_ignore_ascii_case(&self.config.dimension_collection)
            && diff.contains_key(&self.config.dimension_field)
    }

    pub fn extract_insert(
        &self,
        collection: &str,
        event: &ChangeEvent,
        document: &Map<String, Value>,
    ) -> Result<Accepted, SkipReason> {
        let text = Value::Object(document.clone()).to_string();
        let inserted = self
            .decoders
            .for_collection(collection)
            .decode(&text)
            .map_err(SkipReason::Unparseable)?;
        self.check_document_key(event)?;

        Ok(Accepted {
            kind: AcceptedKind::Insert,
            record: VersionRecord::inserted(event.document_key.clone(), inserted.clone()),
            payload: inserted,
            psd: false,
        })
    }

    pub async fn extract_update(
        &self,
        collection: &str,
        event: &ChangeEvent,
        diff: &UpdateDescription,
    ) -> Result<Accepted, SkipReason> {
        let psd = self.is_psd(collection, &diff.updated_fields);

        let assembled = match self.resolve_composite_keys(&diff.updated_fields).await? {
            Some(resolved) => resolved,
            None => diff.updated_fields.clone(),
        };
        let updated = self.parse_with_fallback(collection, &assembled)?;
        self.check_document_key(event)?;

        Ok(Accepted {
            kind: AcceptedKind::Update,
            record: VersionRecord::updated(
                event.document_key.clone(),
                updated.clone(),
                diff.removed_fields.clone(),
            ),
            payload: updated,
            psd,
        })
    }

    /// Replace composite identifier fields by the entities they reference.
    /// Returns `None` when no field resolved to anything.
    async fn resolve_composite_keys(
        &self,
        diff: &Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>, SkipReason> {
        let mut resolved = Map::new();
        for (field, value) in diff
            .iter()
            .filter(|(field, _)| field.contains(&self.config.composite_key_marker))
        {
            let Value::String(key) = value else {
                warn!(field = %field, "composite identifier is not a string, leaving it as is");
                continue;
            };
            let parts: Vec<&str> = key.split(self.config.composite_key_delimiter.as_str()).collect();
            match self.resolver.resolve(&parts).await {
                Ok(Some(entity)) if !entity.is_null() => {
                    debug!(field = %field, key = %key, "resolved composite identifier");
                    resolved.insert(field.clone(), entity);
                }
                Ok(_) => debug!(field = %field, key = %key, "composite identifier resolved to nothing"),
                Err(e) => return Err(SkipReason::Unresolved(e.to_string())),
            }
        }
        Ok((!resolved.is_empty()).then_some(resolved))
    }

    /// Strict decode, then one retry after rewriting legacy shapes.
    fn parse_with_fallback(
        &self,
        collection: &str,
        fields: &Map<String, Value>,
    ) -> Result<Map<String, Value>, SkipReason> {
        let decoder = self.decoders.for_collection(collection);
        let text = Value::Object(fields.clone()).to_string();

        match decoder.decode(&text) {
            Ok(parsed) => Ok(parsed),
            Err(first) => {
                info!(
                    collection = %collection,
                    error = %first,
                    "updated fields failed strict parsing, reformatting legacy shapes"
                );
                let reformatted = reformat_legacy(&text).map_err(SkipReason::Unparseable)?;
                decoder.decode(&reformatted).map_err(SkipReason::Unparseable)
            }
        }
    }

    fn check_document_key(&self, event: &ChangeEvent) -> Result<(), SkipReason> {
        self.decoders
            .generic()
            .decode(&event.document_key.to_string())
            .map(|_| ())
            .map_err(SkipReason::InvalidDocumentKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OperationKind, ResumeToken};
    use crate::test_utils::StaticResolver;
    use serde_json::json;

    fn extractor(resolver: Arc<dyn EntityResolver>) -> UpdateDiffExtractor {
        UpdateDiffExtractor::new(ExtractorConfig::default(), DecoderRegistry::new(), resolver)
    }

    fn update(fields: Value, removed: &[&str]) -> (ChangeEvent, UpdateDescription) {
        let description = UpdateDescription {
            updated_fields: fields.as_object().cloned().unwrap_or_default(),
            removed_fields: removed.iter().map(|s| s.to_string()).collect(),
        };
        let event = ChangeEvent {
            operation: OperationKind::Update,
            document_key: json!({"_id": {"$oid": "5f2f6c3e9b1d4c0012345678"}}),
            full_document: None,
            update_description: Some(description.clone()),
            resume_token: ResumeToken(json!({"_data": "01"})),
        };
        (event, description)
    }

    #[tokio::test]
    async fn raw_diff_is_used_verbatim() {
        let extractor = extractor(Arc::new(NoopResolver));
        let (event, diff) = update(json!({"color": "red", "csIdBrand": "brand-42"}), &["size"]);

        let accepted = extractor.extract_update("brand", &event, &diff).await.unwrap();
        assert_eq!(accepted.kind, AcceptedKind::Update);
        assert!(!accepted.psd);
        assert_eq!(
            accepted.record,
            VersionRecord::updated(
                event.document_key.clone(),
                diff.updated_fields.clone(),
                vec!["size".to_string()]
            )
        );
    }

    #[tokio::test]
    async fn composite_identifiers_are_resolved_by_field_name() {
        let resolver = StaticResolver::default()
            .with(&["brand", "42"], json!({"brandName": "Acme"}))
            .with(&["vendor", "7"], Value::Null);
        let extractor = extractor(Arc::new(resolver.clone()));
        let (event, diff) = update(
            json!({"csIdBrand": "brand-42", "csIdVendor": "vendor-7", "color": "red"}),
            &[],
        );

        let accepted = extractor.extract_update("sku", &event, &diff).await.unwrap();
        assert_eq!(
            Value::Object(accepted.payload),
            json!({"csIdBrand": {"brandName": "Acme"}})
        );
        assert_eq!(
            resolver.lookups(),
            vec![vec!["brand".to_string(), "42".to_string()], vec!["vendor".to_string(), "7".to_string()]]
        );
    }

    #[tokio::test]
    async fn resolver_failures_skip_the_event() {
        let extractor = extractor(Arc::new(StaticResolver::failing()));
        let (event, diff) = update(json!({"csIdBrand": "brand-42"}), &[]);

        assert!(matches!(
            extractor.extract_update("sku", &event, &diff).await,
            Err(SkipReason::Unresolved(_))
        ));
    }

    #[tokio::test]
    async fn legacy_diff_is_reformatted() {
        let extractor = extractor(Arc::new(NoopResolver));
        let (event, diff) = update(json!({"modifiedDateTime": {"$date": "1597043200000"}}), &[]);

        let accepted = extractor.extract_update("sku", &event, &diff).await.unwrap();
        assert_eq!(
            accepted.record.updated_fields.map(Value::Object),
            Some(json!({"modifiedDateTime": {"$date": {"$numberLong": "1597043200000"}}}))
        );
    }

    #[tokio::test]
    async fn unparseable_diff_is_skipped() {
        let extractor = extractor(Arc::new(NoopResolver));
        let (event, diff) = update(json!({"price": {"$numberLong": "twelve"}}), &[]);

        assert!(matches!(
            extractor.extract_update("sku", &event, &diff).await,
            Err(SkipReason::Unparseable(_))
        ));
    }

    #[tokio::test]
    async fn document_key_must_round_trip() {
        let extractor = extractor(Arc::new(NoopResolver));
        let (mut event, diff) = update(json!({"color": "red"}), &[]);
        event.document_key = json!({"_id": {"$oid": "not-an-object-id"}});

        assert!(matches!(
            extractor.extract_update("sku", &event, &diff).await,
            Err(SkipReason::InvalidDocumentKey(_))
        ));
    }

    #[tokio::test]
    async fn dimension_updates_are_flagged_on_the_dimension_collection_only() {
        let extractor = extractor(Arc::new(NoopResolver));
        let (event, diff) = update(json!({DIMENSION_FIELD: [{"skuNumber": "1"}]}), &[]);

        assert!(extractor.extract_update("SKU", &event, &diff).await.unwrap().psd);
        assert!(!extractor.extract_update("brand", &event, &diff).await.unwrap().psd);
    }

    #[test]
    fn inserts_are_decoded_strictly() {
        let extractor = extractor(Arc::new(NoopResolver));
        let document = json!({"name": "tee", "size": "M"});
        let event = ChangeEvent {
            operation: OperationKind::Insert,
            document_key: json!({"_id": 1}),
            full_document: document.as_object().cloned(),
            update_description: None,
            resume_token: ResumeToken(json!({"_data": "01"})),
        };

        let accepted = extractor
            .extract_insert("sku", &event, document.as_object().unwrap())
            .unwrap();
        assert_eq!(accepted.kind, AcceptedKind::Insert);
        assert_eq!(accepted.record.inserted_fields.map(Value::Object), Some(document));

        let broken = json!({"created": {"$date": "1597043200000"}});
        assert!(matches!(
            extractor.extract_insert("sku", &event, broken.as_object().unwrap()),
            Err(SkipReason::Unparseable(_))
        ));
    }
}
