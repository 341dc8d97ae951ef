use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix appended to a collection name to build its token record key.
pub const TOKEN_KEY_SUFFIX: &str = "_token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Replace, drop, rename, invalidate and anything the feed adds later.
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Other(name) => name,
        }
    }
}

/// Opaque change feed position. Only the feed that produced it can interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub Value);

impl ResumeToken {
    /// Serialized form stored in the token record.
    pub fn to_blob(&self) -> String {
        self.0.to_string()
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob).map(ResumeToken)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDescription {
    pub updated_fields: Map<String, Value>,
    pub removed_fields: Vec<String>,
}

/// One mutation pulled from a change feed. Documents are relaxed Extended JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationKind,
    pub document_key: Value,
    pub full_document: Option<Map<String, Value>>,
    pub update_description: Option<UpdateDescription>,
    pub resume_token: ResumeToken,
}

/// Normalized record appended to a collection's history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub document_key: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_fields: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_fields: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_fields: Option<Vec<String>>,
}

impl VersionRecord {
    pub fn inserted(document_key: Value, fields: Map<String, Value>) -> Self {
        Self {
            document_key,
            inserted_fields: Some(fields),
            updated_fields: None,
            removed_fields: None,
        }
    }

    pub fn updated(document_key: Value, fields: Map<String, Value>, removed: Vec<String>) -> Self {
        Self {
            document_key,
            inserted_fields: None,
            updated_fields: Some(fields),
            removed_fields: Some(removed),
        }
    }
}

pub fn token_key(collection: &str) -> String {
    format!("{}{}", collection, TOKEN_KEY_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_blob_round_trips() {
        let token = ResumeToken(json!({"_data": "8263A1"}));
        let blob = token.to_blob();
        assert_eq!(blob, r#"{"_data":"8263A1"}"#);
        assert_eq!(ResumeToken::from_blob(&blob).unwrap(), token);
        assert!(ResumeToken::from_blob("{\"_data\":").is_err());
    }

    #[test]
    fn history_record_shape() {
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        let record = VersionRecord::updated(json!({"_id": 7}), fields, vec!["size".to_string()]);

        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "documentKey": {"_id": 7},
                "updatedFields": {"color": "red"},
                "removedFields": ["size"],
            })
        );

        let inserted = VersionRecord::inserted(json!({"_id": 8}), Map::new());
        assert_eq!(
            serde_json::to_value(&inserted).unwrap(),
            json!({"documentKey": {"_id": 8}, "insertedFields": {}})
        );
    }

    #[test]
    fn token_keys_are_collection_scoped() {
        assert_eq!(token_key("sku"), "sku_token");
    }
}
