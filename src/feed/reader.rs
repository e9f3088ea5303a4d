use super::connection::{ConnectionManager, FeedRequest};
use super::credentials::CredentialProvider;
use super::{KeywordFilter, RecordDecoder};
use crate::db::PollStore;
use crate::error::FeedError;
use crate::models::VoteEvent;
use crate::shutdown::StopFlag;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

/// Reads the live feed and turns matching records into vote events,
/// reconnecting until stopped.
pub struct StreamReader {
    store: Arc<dyn PollStore>,
    credentials: Arc<dyn CredentialProvider>,
    connections: Arc<ConnectionManager>,
    feed_url: Url,
    reconnect_backoff: Duration,
    stop: StopFlag,
}

/// Control side of a running [`StreamReader`].
pub struct ReaderHandle {
    stop_tx: mpsc::Sender<()>,
    stopped_rx: oneshot::Receiver<()>,
}

impl ReaderHandle {
    /// Never blocks; repeated requests collapse into one.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub async fn stopped(self) {
        let _ = self.stopped_rx.await;
    }
}

impl StreamReader {
    pub fn new(
        store: Arc<dyn PollStore>,
        credentials: Arc<dyn CredentialProvider>,
        connections: Arc<ConnectionManager>,
        feed_url: Url,
        reconnect_backoff: Duration,
        stop: StopFlag,
    ) -> Self {
        Self {
            store,
            credentials,
            connections,
            feed_url,
            reconnect_backoff,
            stop,
        }
    }

    /// Spawns the read loop. `votes` is dropped when the loop exits.
    pub fn start(self, votes: mpsc::Sender<VoteEvent>) -> ReaderHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        tokio::spawn(async move {
            self.run(&votes, &mut stop_rx).await;
            drop(votes);
            let _ = stopped_tx.send(());
        });

        ReaderHandle { stop_tx, stopped_rx }
    }

    async fn run(&self, votes: &mpsc::Sender<VoteEvent>, stop_rx: &mut mpsc::Receiver<()>) {
        loop {
            if self.stop_requested(stop_rx) {
                break;
            }

            info!("Querying feed...");
            match self.read_once(votes).await {
                Ok(records) => info!("Feed stream ended after {} record(s)", records),
                Err(e) => warn!("Stopped reading from feed: {}", e),
            }
            if votes.is_closed() {
                warn!("Vote channel closed, feed reader exiting");
                return;
            }
            // Stop may have landed mid-attempt; don't wait out the backoff
            if self.stop.is_set() {
                break;
            }

            debug!("Waiting {:?} before reconnecting", self.reconnect_backoff);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
                _ = stop_rx.recv() => break,
            }
        }
        info!("Stopping feed reader...");
    }

    fn stop_requested(&self, stop_rx: &mut mpsc::Receiver<()>) -> bool {
        !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) || self.stop.is_set()
    }

    fn filter_request(&self, keywords: &KeywordFilter) -> Result<FeedRequest, FeedError> {
        let track = keywords.track_param();
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("track", &track)
            .finish();
        let authorization = self
            .credentials
            .authorization("POST", &self.feed_url, &[("track", track.as_str())])?;

        Ok(FeedRequest {
            url: self.feed_url.clone(),
            body,
            authorization,
        })
    }

    /// One connection's worth of reading. Returns the number of records
    /// decoded before the stream ended cleanly.
    async fn read_once(&self, votes: &mpsc::Sender<VoteEvent>) -> Result<usize, FeedError> {
        let keywords = KeywordFilter::new(self.store.load_options().await?);
        if keywords.is_empty() {
            return Err(FeedError::NoKeywords);
        }

        let request = self.filter_request(&keywords)?;
        // Loading options can take a while; don't dial if shutdown began meanwhile
        if self.stop.is_set() {
            return Err(FeedError::Closed);
        }
        let mut connection = self.connections.open(&request).await?;
        info!(
            "Connected to feed (connection #{}), tracking {} keyword(s)",
            connection.id(),
            keywords.len()
        );

        let mut decoder = RecordDecoder::default();
        let mut records = 0;
        while let Some(chunk) = connection.next_chunk().await? {
            decoder.push(&chunk);
            while let Some(record) = decoder.next_record()? {
                records += 1;
                for option in keywords.matches(&record.text) {
                    debug!("vote: {}", option);
                    votes
                        .send(option.to_string())
                        .await
                        .map_err(|_| FeedError::Closed)?;
                }
            }
        }
        Ok(records)
    }
}

/// Periodically closes the live connection so the reader reconnects with a
/// freshly loaded keyword list. Exits once the stop flag is set.
pub fn spawn_refresh(connections: Arc<ConnectionManager>, stop: StopFlag, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.wait() => return,
            }
            if stop.is_set() {
                return;
            }
            debug!("Refreshing feed connection to reload options");
            connections.close();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::feed::credentials::BearerToken;
    use crate::feed::testing::{chunk, ScriptedDialer};
    use crate::models::Poll;

    const LONG: Duration = Duration::from_secs(3600);

    async fn store_with(options: &[&str]) -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        let poll = Poll::new("poll".to_string(), options.iter().map(|o| o.to_string()).collect(), None);
        db.create_poll(&poll).await.unwrap();
        Arc::new(db)
    }

    fn reader(
        store: Arc<Database>,
        credentials: BearerToken,
        connections: &Arc<ConnectionManager>,
        backoff: Duration,
        stop: &StopFlag,
    ) -> StreamReader {
        StreamReader::new(
            store,
            Arc::new(credentials),
            Arc::clone(connections),
            Url::parse("https://feed.example/filter").unwrap(),
            backoff,
            stop.clone(),
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<VoteEvent>) -> Option<VoteEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap()
    }

    #[tokio::test]
    async fn one_record_emits_every_matching_keyword_in_order() {
        let store = store_with(&["cats", "dogs"]).await;
        let dialer = Arc::new(ScriptedDialer::default());
        let feed = dialer.script();
        let connections = Arc::new(ConnectionManager::new(dialer.clone(), Duration::from_secs(5)));
        let stop = StopFlag::new();
        let (votes_tx, mut votes_rx) = mpsc::channel(16);

        let handle = reader(store, BearerToken::fixed("t0k3n"), &connections, LONG, &stop).start(votes_tx);

        feed.send(chunk(r#"{"text":"I love "#)).unwrap();
        feed.send(chunk("cats and dogs\"}\r\n")).unwrap();
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("cats"));
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("dogs"));

        let request = &dialer.requests()[0];
        assert_eq!(request.body, "track=cats%2Cdogs");
        assert_eq!(request.authorization, "Bearer t0k3n");

        handle.request_stop();
        connections.close();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
        assert!(recv(&mut votes_rx).await.is_none());
    }

    #[tokio::test]
    async fn stop_mid_stream_does_not_reconnect() {
        let store = store_with(&["cats"]).await;
        let dialer = Arc::new(ScriptedDialer::default());
        let feed = dialer.script();
        let _spare = dialer.script();
        let connections = Arc::new(ConnectionManager::new(dialer.clone(), Duration::from_secs(5)));
        let stop = StopFlag::new();
        let (votes_tx, mut votes_rx) = mpsc::channel(16);

        let handle = reader(store, BearerToken::fixed("t"), &connections, Duration::from_millis(10), &stop)
            .start(votes_tx);

        feed.send(chunk(r#"{"text":"cats"}"#)).unwrap();
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("cats"));

        stop.request();
        handle.request_stop();
        connections.close();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();

        // Records arriving after the close are never decoded
        let _ = feed.send(chunk(r#"{"text":"cats"}"#));
        assert!(recv(&mut votes_rx).await.is_none());
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn reconnect_reloads_the_keyword_list() {
        let store = store_with(&["cats"]).await;
        let dialer = Arc::new(ScriptedDialer::default());
        let first = dialer.script();
        let second = dialer.script();
        let connections = Arc::new(ConnectionManager::new(dialer.clone(), Duration::from_secs(5)));
        let stop = StopFlag::new();
        let (votes_tx, mut votes_rx) = mpsc::channel(16);

        let handle = reader(store.clone(), BearerToken::fixed("t"), &connections, Duration::from_millis(10), &stop)
            .start(votes_tx);

        first.send(chunk(r#"{"text":"cats and fish"}"#)).unwrap();
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("cats"));

        let fish = Poll::new("water".to_string(), vec!["fish".to_string()], None);
        store.create_poll(&fish).await.unwrap();
        drop(first);

        second.send(chunk(r#"{"text":"cats and fish"}"#)).unwrap();
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("cats"));
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("fish"));

        let requests = dialer.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].body, "track=cats%2Cfish");

        handle.request_stop();
        connections.close();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_record_ends_the_connection() {
        let store = store_with(&["cats"]).await;
        let dialer = Arc::new(ScriptedDialer::default());
        let first = dialer.script();
        let second = dialer.script();
        let connections = Arc::new(ConnectionManager::new(dialer.clone(), Duration::from_secs(5)));
        let stop = StopFlag::new();
        let (votes_tx, mut votes_rx) = mpsc::channel(16);

        let handle = reader(store, BearerToken::fixed("t"), &connections, Duration::from_millis(10), &stop)
            .start(votes_tx);

        first.send(chunk("{\"text\": garbage} {\"text\":\"cats\"}")).unwrap();
        second.send(chunk(r#"{"text":"more cats"}"#)).unwrap();
        assert_eq!(recv(&mut votes_rx).await.as_deref(), Some("cats"));
        assert_eq!(dialer.dials(), 2);

        handle.request_stop();
        connections.close();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_never_dial() {
        let store = store_with(&["cats"]).await;
        let dialer = Arc::new(ScriptedDialer::default());
        let connections = Arc::new(ConnectionManager::new(dialer.clone(), Duration::from_secs(5)));
        let stop = StopFlag::new();
        let (votes_tx, _votes_rx) = mpsc::channel(16);

        let handle = reader(
            store,
            BearerToken::from_env("TRUSTY_TALLY_TEST_TOKEN_THAT_IS_NEVER_SET"),
            &connections,
            Duration::from_millis(5),
            &stop,
        )
        .start(votes_tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.request_stop();
        tokio::time::timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
        assert_eq!(dialer.dials(), 0);
    }

    #[tokio::test]
    async fn refresh_closes_the_connection_until_stopped() {
        let dialer = Arc::new(ScriptedDialer::default());
        let _feed = dialer.script();
        let connections = Arc::new(ConnectionManager::new(dialer, Duration::from_secs(5)));
        let request = FeedRequest {
            url: Url::parse("https://feed.example/filter").unwrap(),
            body: String::new(),
            authorization: String::new(),
        };
        let mut conn = connections.open(&request).await.unwrap();
        let stop = StopFlag::new();

        let refresher = spawn_refresh(Arc::clone(&connections), stop.clone(), Duration::from_millis(10));
        let result = tokio::time::timeout(Duration::from_secs(2), conn.next_chunk()).await.unwrap();
        assert!(matches!(result, Err(FeedError::Closed)));

        stop.request();
        tokio::time::timeout(Duration::from_secs(2), refresher).await.unwrap().unwrap();
    }
}
