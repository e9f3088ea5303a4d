use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{info, warn};
use std::pin::Pin;

/// Decoded votes arriving from the broker.
pub type VoteStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Fire-and-forget publishing side of the broker.
#[async_trait]
pub trait VoteProducer: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Flush anything still buffered. Called once, after the last publish.
    async fn stop(&self) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        info!("Connecting to broker at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self { client })
    }

    /// Joins `group` on `topic`; each message goes to one member of the group.
    /// Payloads that are not UTF-8 are dropped with a warning.
    pub async fn subscribe_votes(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<VoteStream, BrokerError> {
        info!("Subscribing to {} as {}", topic, group);
        let subscriber = self
            .client
            .queue_subscribe(topic.to_string(), group.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let votes = subscriber.filter_map(|message| async move {
            match String::from_utf8(message.payload.to_vec()) {
                Ok(vote) => Some(vote),
                Err(e) => {
                    warn!("Dropping non UTF-8 vote on {}: {}", message.subject, e);
                    None
                }
            }
        });
        Ok(votes.boxed())
    }
}

#[async_trait]
impl VoteProducer for NatsBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}
