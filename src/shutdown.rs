use crate::feed::connection::ConnectionManager;
use crate::feed::reader::ReaderHandle;
use crate::models::VoteEvent;
use crate::tasks::publisher::PublisherHandle;
use log::{info, warn};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

#[derive(Default)]
struct StopState {
    stopped: Mutex<bool>,
    notify: Notify,
}

/// Shared "shutdown requested" flag. Set once, never cleared.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopState>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn request(&self) -> bool {
        let mut stopped = self.inner.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return false;
        }
        *stopped = true;
        drop(stopped);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.inner.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a request in between is not missed
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Stopped,
}

/// Tears the streaming side down in order: flag, reader, connection,
/// vote channel, publisher. Progress is published on a watch channel.
pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    stop: StopFlag,
    connections: Arc<ConnectionManager>,
    reader: ReaderHandle,
    publisher: PublisherHandle,
    votes: mpsc::Sender<VoteEvent>,
    refresh: JoinHandle<()>,
}

impl ShutdownCoordinator {
    pub fn new(
        stop: StopFlag,
        connections: Arc<ConnectionManager>,
        reader: ReaderHandle,
        publisher: PublisherHandle,
        votes: mpsc::Sender<VoteEvent>,
        refresh: JoinHandle<()>,
    ) -> Self {
        Self {
            state: watch::channel(ShutdownState::Running).0,
            stop,
            connections,
            reader,
            publisher,
            votes,
            refresh,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Follow state transitions, including after the coordinator is consumed.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Blocks until SIGINT or SIGTERM, then shuts down.
    pub async fn run_until_signal(self) -> ShutdownState {
        if let Err(e) = wait_for_signal(false).await {
            warn!("Failed to install signal handlers, shutting down: {}", e);
        }
        self.shutdown().await
    }

    pub async fn shutdown(self) -> ShutdownState {
        let Self {
            state,
            stop,
            connections,
            reader,
            publisher,
            votes,
            refresh,
        } = self;
        info!("Stopping...");
        state.send_replace(ShutdownState::Stopping);

        // Flag first, so an attempt already past its last check can't dial
        stop.request();
        reader.request_stop();
        connections.shutdown();

        reader.stopped().await;
        info!("Feed reader stopped");

        // Reader has exited, so this was the last sender
        drop(votes);
        publisher.stopped().await;
        info!("Publisher stopped");

        if let Err(e) = refresh.await {
            warn!("Refresh task ended abnormally: {}", e);
        }

        state.send_replace(ShutdownState::Stopped);
        info!("Feed side stopped");
        ShutdownState::Stopped
    }
}

/// Resolves on SIGINT or SIGTERM, and on SIGHUP too when `hangup` is set.
pub async fn wait_for_signal(hangup: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hup = if hangup {
            Some(signal(SignalKind::hangup())?)
        } else {
            None
        };

        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
            Some(_) = async {
                match hup.as_mut() {
                    Some(h) => h.recv().await,
                    None => std::future::pending::<Option<()>>().await,
                }
            } => info!("Received SIGHUP"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = hangup;
        tokio::signal::ctrl_c().await
    }
}
