use crate::broker::VoteProducer;
use crate::models::VoteEvent;
use bytes::Bytes;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Relays vote events from the reader onto the broker topic.
pub struct VotePublisher {
    producer: Arc<dyn VoteProducer>,
    topic: String,
}

pub struct PublisherHandle {
    stopped_rx: oneshot::Receiver<()>,
}

impl PublisherHandle {
    /// Resolves once the vote channel closed and every buffered vote was handed
    /// to the broker.
    pub async fn stopped(self) {
        let _ = self.stopped_rx.await;
    }
}

impl VotePublisher {
    pub fn new(producer: Arc<dyn VoteProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn start(self, votes: mpsc::Receiver<VoteEvent>) -> PublisherHandle {
        let (stopped_tx, stopped_rx) = oneshot::channel();
        tokio::spawn(async move {
            self.run(votes).await;
            let _ = stopped_tx.send(());
        });
        PublisherHandle { stopped_rx }
    }

    async fn run(&self, mut votes: mpsc::Receiver<VoteEvent>) {
        let mut published = 0u64;
        while let Some(vote) = votes.recv().await {
            // Not retried: the feed repeats popular votes soon enough
            match self.producer.publish(&self.topic, Bytes::from(vote)).await {
                Ok(()) => published += 1,
                Err(e) => warn!("Failed to publish vote: {}", e),
            }
        }

        info!("Publisher: Stopping after {} vote(s)", published);
        if let Err(e) = self.producer.stop().await {
            warn!("Publisher: {}", e);
        }
        info!("Publisher: Stopped");
    }
}
