use crate::error::FeedError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use log::{debug, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FeedError>> + Send>>;

/// A signed filter subscription, ready to send.
#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub url: Url,
    /// `application/x-www-form-urlencoded` body
    pub body: String,
    pub authorization: String,
}

/// Opens the streaming response for a request.
#[async_trait]
pub trait FeedDialer: Send + Sync {
    async fn dial(&self, request: &FeedRequest) -> Result<ByteStream, FeedError>;
}

pub struct HttpDialer {
    client: reqwest::Client,
}

impl HttpDialer {
    pub fn new(connect_timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedDialer for HttpDialer {
    async fn dial(&self, request: &FeedRequest) -> Result<ByteStream, FeedError> {
        let response = self
            .client
            .post(request.url.clone())
            .header(AUTHORIZATION, &request.authorization)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        Ok(response.bytes_stream().map_err(FeedError::from).boxed())
    }
}

struct ActiveSlot {
    id: u64,
    closer: CancellationToken,
}

#[derive(Default)]
struct Slots {
    active: Option<ActiveSlot>,
    // Set once by shutdown; open refuses from then on
    shut_down: bool,
}

impl Slots {
    fn cancel_active(&mut self) -> Option<u64> {
        let slot = self.active.take()?;
        slot.closer.cancel();
        Some(slot.id)
    }
}

/// Owner of the one live feed connection. Opening a new connection closes
/// the previous one; both operations run under the same lock. After
/// [`ConnectionManager::shutdown`] no new connection can be opened.
pub struct ConnectionManager {
    dialer: Arc<dyn FeedDialer>,
    connect_timeout: Duration,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn FeedDialer>, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            connect_timeout,
            slots: Mutex::new(Slots::default()),
            next_id: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn open(&self, request: &FeedRequest) -> Result<FeedConnection, FeedError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let closer = CancellationToken::new();

        // Check and install under one lock so a concurrent shutdown can't slip between
        let previous = {
            let mut slots = self.slots();
            if slots.shut_down {
                debug!("Refusing to open feed connection #{} after shutdown", id);
                return Err(FeedError::Closed);
            }
            let previous = slots.cancel_active();
            slots.active = Some(ActiveSlot {
                id,
                closer: closer.clone(),
            });
            previous
        };
        if let Some(previous) = previous {
            debug!("Closed feed connection #{} before redialing", previous);
        }

        let dial = tokio::time::timeout(self.connect_timeout, self.dialer.dial(request));
        let body = tokio::select! {
            _ = closer.cancelled() => return Err(FeedError::Closed),
            dialed = dial => match dialed {
                Ok(Ok(body)) => body,
                // Failed dials must not leave a slot behind
                Ok(Err(e)) => {
                    self.release(id);
                    return Err(e);
                }
                Err(_) => {
                    self.release(id);
                    return Err(FeedError::ConnectTimeout(self.connect_timeout));
                }
            },
        };

        debug!("Opened feed connection #{}", id);
        Ok(FeedConnection { id, body, closed: closer })
    }

    /// Closes the live connection, if any. Safe to call repeatedly.
    pub fn close(&self) -> bool {
        let closed = self.slots().cancel_active();
        match closed {
            Some(id) => {
                info!("Closed feed connection #{}", id);
                true
            }
            None => false,
        }
    }

    /// Closes the live connection and refuses every later `open`.
    pub fn shutdown(&self) -> bool {
        let closed = {
            let mut slots = self.slots();
            slots.shut_down = true;
            slots.cancel_active()
        };
        match closed {
            Some(id) => {
                info!("Closed feed connection #{} for shutdown", id);
                true
            }
            None => {
                debug!("Feed connections shut down with none open");
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.slots()
            .active
            .as_ref()
            .is_some_and(|slot| !slot.closer.is_cancelled())
    }

    // Forget a slot only if it is still ours
    fn release(&self, id: u64) {
        let mut slots = self.slots();
        if slots.active.as_ref().is_some_and(|s| s.id == id) {
            slots.active = None;
        }
    }
}

/// A live response body. Dropping it releases the socket.
pub struct FeedConnection {
    id: u64,
    body: ByteStream,
    closed: CancellationToken,
}

impl FeedConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next body chunk, `Ok(None)` at a clean end of stream, or
    /// `Err(FeedError::Closed)` once the manager closed this connection.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, FeedError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(FeedError::Closed),
            chunk = self.body.next() => chunk.transpose(),
        }
    }
}
