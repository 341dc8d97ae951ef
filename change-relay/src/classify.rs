use serde_json::{Map, Value};

use crate::event::{ChangeEvent, OperationKind, UpdateDescription};

/// What the watcher should do with a single change event.
#[derive(Debug, PartialEq)]
pub enum Classification<'a> {
    /// Classifiable but missing what is needed to build a record.
    Skip(&'static str),
    Insert(&'a Map<String, Value>),
    Update(&'a UpdateDescription),
    /// Deletes are logged only, they never reach the history store.
    Delete,
    Unsupported(String),
}

impl Classification<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Skip(_) => "skip",
            Classification::Insert(_) => "insert",
            Classification::Update(_) => "update",
            Classification::Delete => "delete",
            Classification::Unsupported(_) => "unsupported",
        }
    }
}

pub fn classify(event: &ChangeEvent) -> Classification<'_> {
    match &event.operation {
        OperationKind::Insert => match &event.full_document {
            Some(document) => Classification::Insert(document),
            None => Classification::Skip("insert event carries no full document"),
        },
        OperationKind::Update => match &event.update_description {
            Some(description) => Classification::Update(description),
            // Seen upstream from time to time, not worth more than a warning.
            None => Classification::Unsupported("update without update description".to_string()),
        },
        OperationKind::Delete => Classification::Delete,
        OperationKind::Other(name) => {
            Classification::Unsupported(format!("operation {} is not relayed", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResumeToken;
    use serde_json::json;

    fn event(operation: OperationKind) -> ChangeEvent {
        ChangeEvent {
            operation,
            document_key: json!({"_id": 1}),
            full_document: None,
            update_description: None,
            resume_token: ResumeToken(json!({"_data": "01"})),
        }
    }

    #[test]
    fn inserts_carry_the_full_document() {
        let mut insert = event(OperationKind::Insert);
        insert.full_document = Some(Map::from_iter([("a".to_string(), json!(1))]));

        match classify(&insert) {
            Classification::Insert(document) => assert_eq!(document.get("a"), Some(&json!(1))),
            other => panic!("unexpected classification {:?}", other),
        }
        assert_eq!(
            classify(&event(OperationKind::Insert)).label(),
            "skip"
        );
    }

    #[test]
    fn updates_need_a_description() {
        let mut update = event(OperationKind::Update);
        assert!(matches!(
            classify(&update),
            Classification::Unsupported(_)
        ));

        update.update_description = Some(UpdateDescription {
            updated_fields: Map::new(),
            removed_fields: vec!["gone".to_string()],
        });
        match classify(&update) {
            Classification::Update(description) => {
                assert_eq!(description.removed_fields, vec!["gone".to_string()])
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn deletes_and_other_operations() {
        assert_eq!(classify(&event(OperationKind::Delete)), Classification::Delete);
        assert_eq!(
            classify(&event(OperationKind::Other("replace".to_string()))),
            Classification::Unsupported("operation replace is not relayed".to_string())
        );
    }
}
