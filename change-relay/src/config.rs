use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::diff::{ExtractorConfig, DIMENSION_FIELD};
use crate::publish::KafkaConfig;
use crate::retry::RetryPolicy;
use crate::router::RouterConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    #[envconfig(default = "test")]
    pub mongodb_database: String,

    #[envconfig(default = "t0,t1,t2,t3")]
    pub watched_collections: CollectionList,

    #[envconfig(default = "_coll")]
    pub history_collection_suffix: String,

    #[envconfig(default = "sequence")]
    pub token_collection: String,

    #[envconfig(default = "10")]
    pub flush_threshold: NonZeroUsize,

    #[envconfig(default = "true")]
    pub publish_enabled: bool,

    #[envconfig(default = "csId")]
    pub composite_key_marker: String,

    #[envconfig(default = "-")]
    pub composite_key_delimiter: String,

    #[envconfig(default = "flattenedsku_topic")]
    pub default_topic: String,

    #[envconfig(default = "packageshippingdimension_topic")]
    pub dimension_topic: String,

    #[envconfig(default = "sku")]
    pub dimension_collection: String,

    #[envconfig(default = "1000")]
    pub restart_backoff_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub max_restart_backoff_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline_ms: NonZeroMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn extractor(&self) -> ExtractorConfig {
        ExtractorConfig {
            composite_key_marker: self.composite_key_marker.clone(),
            composite_key_delimiter: self.composite_key_delimiter.clone(),
            dimension_collection: self.dimension_collection.clone(),
            dimension_field: DIMENSION_FIELD.to_string(),
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            enabled: self.publish_enabled,
            default_topic: self.default_topic.clone(),
            dimension_topic: self.dimension_topic.clone(),
        }
    }

    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy::new(2, self.restart_backoff_ms.0, self.max_restart_backoff_ms.0)
    }

    /// Watchers report liveness three times per deadline while waiting for events.
    pub fn liveness_interval(&self) -> time::Duration {
        (self.liveness_deadline_ms.0 / 3).max(time::Duration::from_millis(1))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Millisecond duration that must be greater than zero.
#[derive(Debug, Clone, Copy)]
pub struct NonZeroMsDuration(pub time::Duration);

impl FromStr for NonZeroMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<EnvMsDuration>()? {
            EnvMsDuration(duration) if duration.is_zero() => Err(ParseEnvMsDurationError),
            EnvMsDuration(duration) => Ok(NonZeroMsDuration(duration)),
        }
    }
}

/// Comma separated, de-duplicated list of collection names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct EmptyCollectionListError;

impl FromStr for CollectionList {
    type Err = EmptyCollectionListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut collections: Vec<String> = Vec::new();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if !collections.iter().any(|known| known == name) {
                collections.push(name.to_owned());
            }
        }

        if collections.is_empty() {
            Err(EmptyCollectionListError)
        } else {
            Ok(CollectionList(collections))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.watched_collections.0, vec!["t0", "t1", "t2", "t3"]);
        assert_eq!(config.flush_threshold.get(), 10);
        assert_eq!(config.token_collection, "sequence");
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(config.router().default_topic, "flattenedsku_topic");
        assert_eq!(config.extractor().composite_key_marker, "csId");
    }

    #[test]
    fn overrides() {
        let env = HashMap::from([
            ("WATCHED_COLLECTIONS".to_string(), " sku, brand,sku,,".to_string()),
            ("FLUSH_THRESHOLD".to_string(), "3".to_string()),
            ("PUBLISH_ENABLED".to_string(), "false".to_string()),
            ("COMPOSITE_KEY_DELIMITER".to_string(), "|".to_string()),
            ("KAFKA_HOSTS".to_string(), "kafka:9092".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.watched_collections.0, vec!["sku", "brand"]);
        assert_eq!(config.flush_threshold.get(), 3);
        assert!(!config.router().enabled);
        assert_eq!(config.extractor().composite_key_delimiter, "|");
        assert_eq!(config.kafka.kafka_hosts, "kafka:9092");
    }

    #[test]
    fn rejects_zero_threshold_and_empty_lists() {
        let zero = HashMap::from([("FLUSH_THRESHOLD".to_string(), "0".to_string())]);
        assert!(Config::init_from_hashmap(&zero).is_err());

        assert_eq!(" , ".parse::<CollectionList>(), Err(EmptyCollectionListError));
    }

    #[test]
    fn liveness_deadline_must_be_positive() {
        let zero = HashMap::from([("LIVENESS_DEADLINE_MS".to_string(), "0".to_string())]);
        assert!(Config::init_from_hashmap(&zero).is_err());

        let tiny = HashMap::from([("LIVENESS_DEADLINE_MS".to_string(), "2".to_string())]);
        let config = Config::init_from_hashmap(&tiny).unwrap();
        assert_eq!(config.liveness_interval(), time::Duration::from_millis(1));

        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.liveness_interval(), time::Duration::from_secs(10));
    }
}
