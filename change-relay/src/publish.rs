use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use health::HealthHandle;
use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::error::PublishError;

/// Outbound message sink. Implementations must be safe to share between watchers.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Queue one message. Returning `Ok` does not mean the broker acknowledged it.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError>;
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The stats callback only fires while the rdkafka main loop is running
        self.liveness.report_healthy();

        metrics::gauge!("cdc_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("cdc_kafka_producer_queue_bytes").set(stats.msg_size as f64);
    }
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaPublisher> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::new(10, 0)))?,
        );
        info!("connected to Kafka brokers");

        Ok(KafkaPublisher { producer })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    async fn await_delivery(topic: String, delivery: DeliveryFuture) {
        match delivery.await {
            Ok(Ok(_)) => {
                counter!("cdc_messages_published_total", "topic" => topic).increment(1);
            }
            Ok(Err((err, _))) => {
                counter!("cdc_messages_failed_total", "topic" => topic.clone()).increment(1);
                error!(topic = %topic, "failed to produce to Kafka: {}", err);
            }
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("cdc_messages_failed_total", "topic" => topic.clone()).increment(1);
                error!(topic = %topic, "failed to produce to Kafka before write timeout");
            }
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError> {
        let record = FutureRecord {
            topic,
            payload: Some(&payload),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        };

        match self.producer.send_result(record) {
            Ok(delivery) => {
                tokio::spawn(Self::await_delivery(topic.to_owned(), delivery));
                Ok(())
            }
            Err((e, _)) => {
                counter!("cdc_messages_failed_total", "topic" => topic.to_owned()).increment(1);
                Err(PublishError::Enqueue {
                    topic: topic.to_owned(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;

    fn start_on_mocked_cluster() -> (MockCluster<'static, DefaultProducerContext>, KafkaPublisher) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka", time::Duration::seconds(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
        };
        let publisher = KafkaPublisher::new(&config, handle).expect("failed to create publisher");
        (cluster, publisher)
    }

    #[tokio::test]
    async fn publishes_to_mocked_brokers() {
        let (_cluster, publisher) = start_on_mocked_cluster();

        publisher
            .publish("flattenedsku_topic", Some("{\"_id\":1}"), "{}".to_string())
            .await
            .expect("failed to queue message");
        publisher
            .publish("packageshippingdimension_topic", None, "{}".to_string())
            .await
            .expect("failed to queue keyless message");
        publisher.flush().expect("failed to flush producer");
    }
}
