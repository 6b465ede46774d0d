//! Push channel connection manager.
//!
//! Owns one logical connection to the backend's push channel, the
//! [`ConnectionState`] machine and the subscriber registry. A single driver
//! task per session reads frames, dispatches them in arrival order and runs
//! the reconnect loop; state listeners are invoked on that same path so a
//! delta from a new connection is never seen before its `connected`
//! notification.
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::{
    core::{
        backoff::{Backoff, BackoffPolicy},
        model::{ConnectionState, DeltaEvent},
        registry::{SubscriberRegistry, Subscription},
    },
    metrics,
    ports::push_channel::{ChannelError, ChannelResult, FrameStream, PushTransport},
    tracing_setup::create_channel_span,
};

static GLOBAL: Lazy<ArcSwapOption<ConnectionManager>> = Lazy::new(ArcSwapOption::empty);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time counters of a connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    /// Set once the manager gave up reconnecting
    pub retries_exhausted: bool,
    pub messages_received: u64,
    pub decode_errors: u64,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "Push channel driver panicked");
            }
        }
    }
}

struct Inner {
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
    registry: Arc<SubscriberRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    session: tokio::sync::Mutex<Option<Session>>,
    last_message: Mutex<Option<DeltaEvent>>,
    last_error: Mutex<Option<ChannelError>>,
    sequence: AtomicU64,
    consecutive_failures: AtomicU32,
    retries_exhausted: AtomicBool,
    messages_received: AtomicU64,
    decode_errors: AtomicU64,
}

/// Why the frame pump returned
enum PumpEnd {
    Cancelled,
    /// `stable` is set once the connection delivered a frame or outlived
    /// the longest backoff delay.
    Lost { error: ChannelError, stable: bool },
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(%state, "Push channel state changed");
            metrics::set_channel_state(state);
            self.registry.dispatch_state(state);
        }
    }

    fn record_error(&self, err: &ChannelError) {
        *lock(&self.last_error) = Some(err.clone());
    }

    fn deliver(&self, frame: &str) {
        let mut event = match DeltaEvent::parse(frame, 0) {
            Ok(event) => event,
            Err(err) => {
                self.decode_failed(&err);
                return;
            }
        };
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::increment_channel_messages(&event.event_type);

        *lock(&self.last_message) = Some(event.clone());
        let delivered = self.registry.dispatch(&event);
        trace!(
            event_type = %event.event_type,
            sequence = event.sequence,
            delivered,
            "Delta dispatched"
        );
    }

    fn decode_failed(&self, err: &ChannelError) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::increment_decode_errors("frame");
        warn!(error = %err, "Dropping malformed push frame");
    }

    async fn pump(&self, mut frames: FrameStream, cancel: &CancellationToken) -> PumpEnd {
        let settle = tokio::time::sleep(self.policy.max_delay);
        tokio::pin!(settle);
        let mut stable = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PumpEnd::Cancelled,
                _ = &mut settle, if !stable => {
                    stable = true;
                    self.session_stable();
                    continue;
                }
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if !stable {
                        stable = true;
                        self.session_stable();
                    }
                    self.deliver(&frame);
                }
                Some(Err(err @ ChannelError::Decode(_))) => self.decode_failed(&err),
                Some(Err(error)) => return PumpEnd::Lost { error, stable },
                None => {
                    return PumpEnd::Lost {
                        error: ChannelError::Transport("closed by peer".to_string()),
                        stable,
                    };
                }
            }
        }
    }

    fn session_stable(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if previous > 0 {
            debug!(previous, "Push channel session stable, failure count cleared");
        }
    }

    /// Failed attempt bookkeeping. Returns `true` when the session must stop.
    fn attempt_failed(&self, err: ChannelError) -> bool {
        self.record_error(&err);
        if !err.is_retryable() {
            error!(error = %err, "Push channel rejected credentials, not retrying");
            self.set_state(ConnectionState::Error);
            return true;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(error = %err, failures, "Push channel connection attempt failed");
        self.set_state(ConnectionState::Error);
        false
    }
}

/// Driver of one session: pump frames, then reconnect with backoff until
/// cancelled, rejected or out of attempts.
///
/// The failure count and the backoff are only cleared once a connection is
/// stable, so a backend that accepts and immediately drops connections still
/// runs out of attempts.
async fn run_session(
    inner: Arc<Inner>,
    auth_token: String,
    mut frames: Option<FrameStream>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(inner.policy.clone());

    loop {
        if let Some(stream) = frames.take() {
            match inner.pump(stream, &cancel).await {
                PumpEnd::Cancelled => return,
                PumpEnd::Lost { error, stable } => {
                    inner.record_error(&error);
                    if stable {
                        warn!(%error, "Push channel connection lost");
                        backoff.reset();
                    } else {
                        // A connection that never settled counts as a failed attempt
                        let failures = inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                        warn!(%error, failures, "Push channel dropped before the session settled");
                    }
                    inner.set_state(ConnectionState::Disconnected);
                }
            }
        }

        let failures = inner.consecutive_failures.load(Ordering::Acquire);
        if failures >= inner.policy.max_consecutive_failures {
            error!(
                failures,
                "Giving up on push channel, live updates unavailable"
            );
            inner.retries_exhausted.store(true, Ordering::Release);
            inner.set_state(ConnectionState::Error);
            return;
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "Reconnecting after delay");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        metrics::increment_reconnect_attempts();
        inner.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = inner.transport.open(&auth_token) => opened,
        };
        if cancel.is_cancelled() {
            return;
        }

        match opened {
            Ok(stream) => {
                inner.set_state(ConnectionState::Connected);
                frames = Some(stream);
            }
            Err(err) => {
                if inner.attempt_failed(err) {
                    return;
                }
            }
        }
    }
}

/// Handle to one logical push channel. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.transport.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Build an injectable instance with its own registry
    pub fn new(transport: Arc<dyn PushTransport>, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                registry: SubscriberRegistry::new(),
                state_tx,
                session: tokio::sync::Mutex::new(None),
                last_message: Mutex::new(None),
                last_error: Mutex::new(None),
                sequence: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                retries_exhausted: AtomicBool::new(false),
                messages_received: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Install the process-wide instance, or return the one already installed.
    pub fn init(transport: Arc<dyn PushTransport>, policy: BackoffPolicy) -> Self {
        let candidate = Arc::new(Self::new(transport, policy));
        let previous =
            GLOBAL.rcu(|current| current.clone().or_else(|| Some(Arc::clone(&candidate))));
        match previous {
            Some(existing) => (*existing).clone(),
            None => (*candidate).clone(),
        }
    }

    /// The process-wide instance, if [`ConnectionManager::init`] ran
    pub fn global() -> Option<Self> {
        GLOBAL.load_full().map(|manager| (*manager).clone())
    }

    /// Disconnect and clear the process-wide instance and its registry.
    pub async fn shutdown_global() {
        if let Some(manager) = GLOBAL.swap(None) {
            manager.disconnect().await;
            manager.inner.registry.clear();
            info!("Process-wide push channel shut down");
        }
    }

    /// Open the channel with `auth_token`, replacing any active session.
    ///
    /// The first attempt is awaited. A rejected token is returned as
    /// [`ChannelError::Auth`]; a transport failure is not returned and the
    /// manager keeps retrying in the background.
    pub async fn connect(&self, auth_token: &str) -> ChannelResult<()> {
        let mut session = self.inner.session.lock().await;
        if let Some(previous) = session.take() {
            previous.stop().await;
        }

        self.inner.consecutive_failures.store(0, Ordering::Release);
        self.inner.retries_exhausted.store(false, Ordering::Release);
        *lock(&self.inner.last_error) = None;

        let span = create_channel_span(&self.inner.transport.endpoint());
        self.inner.set_state(ConnectionState::Connecting);
        let opened = self
            .inner
            .transport
            .open(auth_token)
            .instrument(span.clone())
            .await;

        let frames = match opened {
            Ok(frames) => {
                self.inner.set_state(ConnectionState::Connected);
                Some(frames)
            }
            Err(err) if !err.is_retryable() => {
                self.inner.attempt_failed(err.clone());
                return Err(err);
            }
            Err(err) => {
                self.inner.attempt_failed(err);
                None
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            run_session(
                Arc::clone(&self.inner),
                auth_token.to_string(),
                frames,
                cancel.clone(),
            )
            .instrument(span),
        );
        *session = Some(Session { cancel, task });
        Ok(())
    }

    /// Tear the channel down. Subscriptions are kept for the next `connect`.
    pub async fn disconnect(&self) {
        let previous = self.inner.session.lock().await.take();
        if let Some(session) = previous {
            session.stop().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Register `callback` for every event of `event_type`, in arrival order.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        debug!(event_type, "Adding push channel subscriber");
        self.inner.registry.subscribe(event_type, Arc::new(callback))
    }

    /// Register `callback` for every distinct state transition.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_state(Arc::new(callback))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver for passive observers; intermediate states may be coalesced.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Most recently received event of any type
    pub fn last_message(&self) -> Option<DeltaEvent> {
        lock(&self.inner.last_message).clone()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        lock(&self.inner.last_error).clone()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            state: self.state(),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Acquire),
            retries_exhausted: self.inner.retries_exhausted.load(Ordering::Acquire),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            decode_errors: self.inner.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.inner.registry
    }

    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }
}
