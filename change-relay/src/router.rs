use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::diff::{Accepted, DIMENSION_FIELD};
use crate::error::{PublishError, RouteError, TransformError};
use crate::publish::Publisher;

/// Maps an accepted change to the business payload published on the default topic.
pub trait PayloadTransformer: Send + Sync {
    fn transform(&self, collection: &str, document: &Map<String, Value>)
        -> Result<Value, TransformError>;
}

/// Publishes the change as-is, wrapped with the collection it came from.
pub struct PassthroughTransformer;

impl PayloadTransformer for PassthroughTransformer {
    fn transform(
        &self,
        collection: &str,
        document: &Map<String, Value>,
    ) -> Result<Value, TransformError> {
        Ok(json!({ "collection": collection, "document": document }))
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enabled: bool,
    pub default_topic: String,
    pub dimension_topic: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_topic: "flattenedsku_topic".to_string(),
            dimension_topic: "packageshippingdimension_topic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Default,
    Dimension,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub route: Route,
    pub payload: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageDimension {
    pub depth_quantity: Value,
    pub height_quantity: Value,
    pub height_width_depth_unit_of_measure_code: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_date_time: Option<String>,
    pub weight_quantity: Value,
    pub weight_unit_of_measure_code: Value,
    pub width_quantity: Value,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkuDimensions {
    pub sku_number: String,
    pub sku_package_shipping_dimension_list: Vec<PackageDimension>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DimensionMessage {
    pub sku: SkuDimensions,
}

const OUTPUT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

fn date_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|date| date.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        Value::Object(inner) => inner
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

/// Format a dimension timestamp as `yyyy-MM-dd'T'HH:mm:ss.SSS+0000`.
///
/// Accepts a native Extended JSON date (`{"$date": ...}`) or the legacy string
/// encoding of one (`"{\"$date\":1597043200000}"`). Anything else yields `None`.
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    let millis = match value {
        Value::Object(date) => date.get("$date").and_then(date_millis),
        Value::String(legacy) => match serde_json::from_str::<Value>(legacy.trim()) {
            Ok(Value::Object(date)) => date.get("$date").and_then(date_millis),
            _ => None,
        },
        _ => None,
    }?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|date| date.format(OUTPUT_DATE_FORMAT).to_string())
}

fn unit_of_measure_code(entry: &Map<String, Value>, field: &str) -> Value {
    entry
        .get(field)
        .and_then(|unit| unit.get("referenceValueShortDescription"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Minimal dimension payload built from the first entry of the dimension list.
/// `Ok(None)` when the list is absent or empty.
pub fn dimension_message(diff: &Map<String, Value>) -> Result<Option<DimensionMessage>, RouteError> {
    let Some(Value::Array(entries)) = diff.get(DIMENSION_FIELD) else {
        return Ok(None);
    };
    let entry = match entries.first() {
        None => return Ok(None),
        Some(Value::Object(entry)) => entry,
        Some(_) => return Err(RouteError::MissingField("dimension entry")),
    };

    let sku_number = match entry.get("skuNumber") {
        Some(Value::String(number)) => number.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => return Err(RouteError::MissingField("skuNumber")),
    };
    let quantity = |field: &str| entry.get(field).cloned().unwrap_or(Value::Null);

    let modified_date_time = entry.get("modifiedDateTime").and_then(|value| {
        let normalized = normalize_timestamp(value);
        if normalized.is_none() {
            debug!(value = %value, "unparseable dimension timestamp, leaving it out");
        }
        normalized
    });

    Ok(Some(DimensionMessage {
        sku: SkuDimensions {
            sku_number,
            sku_package_shipping_dimension_list: vec![PackageDimension {
                depth_quantity: quantity("depthQuantity"),
                height_quantity: quantity("heightQuantity"),
                height_width_depth_unit_of_measure_code: unit_of_measure_code(
                    entry,
                    "heightWidthDepthUnitOfMeasure",
                ),
                modified_date_time,
                weight_quantity: quantity("weightQuantity"),
                weight_unit_of_measure_code: unit_of_measure_code(entry, "weightUnitOfMeasure"),
                width_quantity: quantity("widthQuantity"),
            }],
        },
    }))
}

/// Decides where an accepted change is republished and sends it there.
pub struct PublishRouter {
    config: RouterConfig,
    transformer: Arc<dyn PayloadTransformer>,
    publisher: Arc<dyn Publisher>,
}

impl PublishRouter {
    pub fn new(
        config: RouterConfig,
        transformer: Arc<dyn PayloadTransformer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            config,
            transformer,
            publisher,
        }
    }

    pub fn topic(&self, route: Route) -> &str {
        match route {
            Route::Default => &self.config.default_topic,
            Route::Dimension => &self.config.dimension_topic,
        }
    }

    /// Build the outbound message for an accepted change, if it gets one.
    pub fn plan(&self, collection: &str, accepted: &Accepted) -> Result<Option<Outbound>, RouteError> {
        if accepted.psd {
            let Some(message) = dimension_message(&accepted.payload)? else {
                return Ok(None);
            };
            let payload = serde_json::to_string(&message).map_err(PublishError::from)?;
            return Ok(Some(Outbound {
                route: Route::Dimension,
                payload,
            }));
        }

        let transformed = self.transformer.transform(collection, &accepted.payload)?;
        Ok(Some(Outbound {
            route: Route::Default,
            payload: transformed.to_string(),
        }))
    }

    /// Publish an accepted change. Never fails: errors are logged and counted.
    pub async fn dispatch(&self, collection: &str, accepted: &Accepted) {
        if !self.config.enabled {
            return;
        }

        let outbound = match self.plan(collection, accepted) {
            Ok(Some(outbound)) => outbound,
            Ok(None) => {
                debug!(collection = %collection, "empty dimension list, nothing to publish");
                return;
            }
            Err(e) => {
                counter!("cdc_route_errors_total", "collection" => collection.to_owned())
                    .increment(1);
                error!(collection = %collection, error = %e, "failed to build outbound payload, continuing");
                return;
            }
        };

        let topic = self.topic(outbound.route);
        let key = accepted.record.document_key.to_string();
        if let Err(e) = self.publisher.publish(topic, Some(&key), outbound.payload).await {
            error!(collection = %collection, topic = %topic, error = %e, "failed to publish change");
        }
    }
}
