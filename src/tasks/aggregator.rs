use crate::broker::VoteStream;
use crate::db::PollStore;
use crate::shutdown::StopFlag;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// How long the subscription must stay quiet after a stop before the last
/// flush.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

// A busy subscription never goes quiet; cap the drain at this many windows
const MAX_DRAIN_WINDOWS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    NoVotes,
    Flushed { options: usize, votes: i64 },
    /// At least one option failed; every pending count was kept.
    Retained { failed: Vec<String> },
}

/// Vote counts waiting for the next flush.
#[derive(Default)]
pub struct Tally {
    pending: Mutex<HashMap<String, i64>>,
}

impl Tally {
    pub async fn record(&self, option: String) {
        *self.pending.lock().await.entry(option).or_insert(0) += 1;
    }

    pub async fn pending(&self) -> HashMap<String, i64> {
        self.pending.lock().await.clone()
    }

    /// Writes every pending count to the store. The map is cleared only if
    /// all writes succeed; votes recorded meanwhile wait on the lock.
    pub async fn flush(&self, store: &dyn PollStore) -> FlushOutcome {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            debug!("No new votes, skipping store update");
            return FlushOutcome::NoVotes;
        }

        info!("Updating store...");
        debug!("{:?}", *pending);
        let mut failed = Vec::new();
        for (option, count) in pending.iter() {
            match store.increment_results(option, *count).await {
                Ok(polls) => debug!("{} +{} across {} poll(s)", option, count, polls),
                Err(e) => {
                    warn!("Failed to update {}: {}", option, e);
                    failed.push(option.clone());
                }
            }
        }

        if !failed.is_empty() {
            warn!("Retaining {} pending option(s) for the next flush", pending.len());
            failed.sort();
            return FlushOutcome::Retained { failed };
        }

        let outcome = FlushOutcome::Flushed {
            options: pending.len(),
            votes: pending.values().sum(),
        };
        pending.clear();
        info!("Finished updating store");
        outcome
    }
}

/// Consumes votes from the broker and periodically persists the counts.
pub struct VoteAggregator {
    tally: Arc<Tally>,
    store: Arc<dyn PollStore>,
    flush_interval: Duration,
    drain_window: Duration,
}

impl VoteAggregator {
    pub fn new(store: Arc<dyn PollStore>, flush_interval: Duration) -> Self {
        Self {
            tally: Arc::new(Tally::default()),
            store,
            flush_interval,
            drain_window: DEFAULT_DRAIN_WINDOW,
        }
    }

    pub fn with_drain_window(mut self, drain_window: Duration) -> Self {
        self.drain_window = drain_window;
        self
    }

    pub fn tally(&self) -> Arc<Tally> {
        Arc::clone(&self.tally)
    }

    /// Runs until `stop` is set or the subscription ends, then makes one last
    /// flush attempt. After a stop, votes already in flight keep being counted
    /// until none arrives for a drain window.
    pub async fn run(self, votes: VoteStream, stop: StopFlag) {
        let mut consumer = tokio::spawn(consume(
            votes,
            Arc::clone(&self.tally),
            stop.clone(),
            self.drain_window,
        ));
        let mut consumer_done = false;

        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tally.flush(self.store.as_ref()).await;
                }
                _ = &mut consumer, if !consumer_done => {
                    consumer_done = true;
                    warn!("Vote subscription ended");
                    break;
                }
                _ = stop.wait() => {
                    info!("Stopping vote aggregator...");
                    break;
                }
            }
        }

        if !consumer_done {
            let limit = self.drain_window * MAX_DRAIN_WINDOWS;
            if timeout(limit, &mut consumer).await.is_err() {
                warn!("Vote subscription still busy after {:?}, no longer counting", limit);
                consumer.abort();
                let _ = consumer.await;
            }
        }

        match self.tally.flush(self.store.as_ref()).await {
            FlushOutcome::Retained { failed } => {
                warn!("Exiting with unsaved votes for {:?}", failed)
            }
            outcome => debug!("Final flush: {:?}", outcome),
        }
    }
}

async fn consume(mut votes: VoteStream, tally: Arc<Tally>, stop: StopFlag, drain_window: Duration) {
    loop {
        let next = if stop.is_set() {
            match timeout(drain_window, votes.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("No votes for {:?}, subscription drained", drain_window);
                    return;
                }
            }
        } else {
            tokio::select! {
                next = votes.next() => next,
                // Switch to draining
                _ = stop.wait() => continue,
            }
        };

        match next {
            Some(vote) => tally.record(vote).await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::StoreError;
    use crate::models::Poll;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    /// Store that applies increments in memory and fails for chosen options.
    #[derive(Default)]
    struct FlakyStore {
        applied: std::sync::Mutex<HashMap<String, i64>>,
        failing: std::sync::Mutex<HashSet<String>>,
        calls: std::sync::Mutex<usize>,
    }

    impl FlakyStore {
        fn fail(&self, option: &str) {
            self.failing.lock().unwrap().insert(option.to_string());
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn applied(&self, option: &str) -> i64 {
            self.applied.lock().unwrap().get(option).copied().unwrap_or(0)
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PollStore for FlakyStore {
        async fn load_options(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        async fn increment_results(&self, option: &str, count: i64) -> Result<u64, StoreError> {
            *self.calls.lock().unwrap() += 1;
            if self.failing.lock().unwrap().contains(option) {
                return Err(StoreError::PollNotFound(option.to_string()));
            }
            *self.applied.lock().unwrap().entry(option.to_string()).or_insert(0) += count;
            Ok(1)
        }
    }

    async fn tally_of(votes: &[&str]) -> Tally {
        let tally = Tally::default();
        for vote in votes {
            tally.record(vote.to_string()).await;
        }
        tally
    }

    fn counts(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn empty_tally_skips_the_store() {
        let store = FlakyStore::default();
        let tally = Tally::default();
        assert_eq!(tally.flush(&store).await, FlushOutcome::NoVotes);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_votes_are_counted_exactly() {
        let tally = Arc::new(Tally::default());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tally = Arc::clone(&tally);
            tasks.push(tokio::spawn(async move {
                for _ in 0..125 {
                    tally.record("cats".to_string()).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tally.pending().await, counts(&[("cats", 1000)]));
    }

    #[tokio::test]
    async fn successful_flush_clears_everything() {
        let store = FlakyStore::default();
        let tally = tally_of(&["cats", "cats", "dogs"]).await;

        let outcome = tally.flush(&store).await;
        assert_eq!(outcome, FlushOutcome::Flushed { options: 2, votes: 3 });
        assert!(tally.pending().await.is_empty());
        assert_eq!(store.applied("cats"), 2);
        assert_eq!(store.applied("dogs"), 1);
    }

    #[tokio::test]
    async fn one_failure_retains_the_whole_batch() {
        let store = FlakyStore::default();
        store.fail("dogs");
        let tally = tally_of(&["cats", "cats", "dogs"]).await;

        let outcome = tally.flush(&store).await;
        assert_eq!(outcome, FlushOutcome::Retained { failed: vec!["dogs".to_string()] });
        assert_eq!(tally.pending().await, counts(&[("cats", 2), ("dogs", 1)]));

        // The retry re-applies cats: all-or-nothing can double count
        store.heal();
        tally.record("dogs".to_string()).await;
        assert_eq!(tally.flush(&store).await, FlushOutcome::Flushed { options: 2, votes: 4 });
        assert_eq!(store.applied("cats"), 4);
        assert_eq!(store.applied("dogs"), 2);
        assert!(tally.pending().await.is_empty());
    }

    #[tokio::test]
    async fn flush_increments_every_poll_in_the_store() {
        let db = Database::in_memory().await.unwrap();
        let pets = Poll::new("pets".to_string(), vec!["cats".to_string(), "dogs".to_string()], None);
        let cats = Poll::new("cats only".to_string(), vec!["cats".to_string()], None);
        db.create_poll(&pets).await.unwrap();
        db.create_poll(&cats).await.unwrap();

        let tally = tally_of(&["cats", "dogs", "cats"]).await;
        tally.flush(&db).await;

        assert_eq!(db.get_poll(&pets.id).await.unwrap().votes_for("cats"), 2);
        assert_eq!(db.get_poll(&pets.id).await.unwrap().votes_for("dogs"), 1);
        assert_eq!(db.get_poll(&cats.id).await.unwrap().votes_for("cats"), 2);
    }

    #[tokio::test]
    async fn run_flushes_on_ticks_and_once_more_on_stop() {
        let store = Arc::new(FlakyStore::default());
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let votes: VoteStream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|vote| (vote, rx))
        }));
        let stop = StopFlag::new();

        let aggregator = VoteAggregator::new(store.clone(), Duration::from_millis(10));
        let tally = aggregator.tally();
        let running = tokio::spawn(aggregator.run(votes, stop.clone()));

        tx.send("cats".to_string()).unwrap();
        tx.send("cats".to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.applied("cats") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        store.fail("dogs");
        tx.send("dogs".to_string()).unwrap();
        stop.request();
        tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();

        assert_eq!(store.applied("cats"), 2);
        assert_eq!(store.applied("dogs"), 0);
        assert!(tally.pending().await.get("cats").is_none());
    }

    #[tokio::test]
    async fn votes_arriving_after_stop_are_still_flushed() {
        let store = Arc::new(FlakyStore::default());
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let votes: VoteStream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|vote| (vote, rx))
        }));
        let stop = StopFlag::new();

        let aggregator = VoteAggregator::new(store.clone(), Duration::from_secs(3600))
            .with_drain_window(Duration::from_millis(200));
        let running = tokio::spawn(aggregator.run(votes, stop.clone()));

        // Stop first, then let the last votes trickle in, as a broker round trip would
        stop.request();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send("cats".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send("dogs".to_string()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert_eq!(store.applied("cats"), 1);
        assert_eq!(store.applied("dogs"), 1);
    }

    #[tokio::test]
    async fn drain_is_capped_for_a_busy_subscription() {
        let store = Arc::new(FlakyStore::default());
        let votes: VoteStream = Box::pin(futures_util::stream::unfold((), |_| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Some(("cats".to_string(), ()))
        }));
        let stop = StopFlag::new();
        stop.request();

        let aggregator = VoteAggregator::new(store.clone(), Duration::from_secs(3600))
            .with_drain_window(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), aggregator.run(votes, stop))
            .await
            .unwrap();

        assert!(store.applied("cats") > 0);
    }

    #[tokio::test]
    async fn run_ends_when_the_subscription_ends() {
        let store = Arc::new(FlakyStore::default());
        let votes: VoteStream = Box::pin(futures_util::stream::iter(vec!["cats".to_string()]));

        let aggregator = VoteAggregator::new(store.clone(), Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(2), aggregator.run(votes, StopFlag::new()))
            .await
            .unwrap();

        assert_eq!(store.applied("cats"), 1);
    }
}
