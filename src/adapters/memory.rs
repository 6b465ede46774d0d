//! In-memory adapters for the push channel and the snapshot endpoint.
//!
//! Both are scriptable: tests (and offline demos) decide when a connection
//! opens, fails or drops and what each snapshot pull returns.
use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    core::model::{Period, Snapshot},
    ports::{
        push_channel::{ChannelError, ChannelResult, FrameStream, PushTransport},
        snapshot_source::{FetchError, FetchResult, SnapshotSource},
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct TransportState {
    scripted_failures: VecDeque<ChannelError>,
    offline: bool,
    current: Option<mpsc::UnboundedSender<ChannelResult<String>>>,
    opens: usize,
    last_token: Option<String>,
}

/// Push transport whose connections are fed by the test.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `open` with `err`. Calls queue up.
    pub fn fail_next(&self, err: ChannelError) {
        lock(&self.state).scripted_failures.push_back(err);
    }

    /// While offline every `open` fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    /// Send a raw text frame on the current connection.
    ///
    /// Returns `false` when no connection is open.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        match &lock(&self.state).current {
            Some(tx) => tx.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Send a `{type, data}` frame on the current connection.
    pub fn push_event(&self, event_type: &str, data: Value) -> bool {
        self.push(json!({ "type": event_type, "data": data }).to_string())
    }

    /// Close the current connection as if the peer hung up.
    pub fn drop_connection(&self) {
        lock(&self.state).current = None;
    }

    /// Break the current connection with a transport error.
    pub fn break_connection(&self, reason: &str) {
        if let Some(tx) = lock(&self.state).current.take() {
            let _ = tx.send(Err(ChannelError::Transport(reason.to_string())));
        }
    }

    /// Whether a connection is open and its reader is still alive
    pub fn is_open(&self) -> bool {
        lock(&self.state)
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn last_token(&self) -> Option<String> {
        lock(&self.state).last_token.clone()
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn open(&self, auth_token: &str) -> ChannelResult<FrameStream> {
        let mut state = lock(&self.state);
        state.opens += 1;
        state.last_token = Some(auth_token.to_string());

        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        if state.offline {
            return Err(ChannelError::Transport("memory transport offline".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn endpoint(&self) -> String {
        "memory://push".to_string()
    }
}

/// Snapshot source answering from a script.
///
/// Queued responses are consumed first, then the fallback snapshot is
/// repeated. `pause` holds every pull in flight until `resume`.
pub struct MemorySnapshotSource {
    queued: Mutex<VecDeque<FetchResult<Snapshot>>>,
    fallback: Mutex<Option<Snapshot>>,
    gate: watch::Sender<bool>,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl Default for MemorySnapshotSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            gate,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    /// Source that always answers with `snapshot`
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let source = Self::new();
        source.set_fallback(snapshot);
        source
    }

    pub fn push_response(&self, response: FetchResult<Snapshot>) {
        lock(&self.queued).push_back(response);
    }

    pub fn set_fallback(&self, snapshot: Snapshot) {
        *lock(&self.fallback) = Some(snapshot);
    }

    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Pulls that have started, including ones held by `pause`
    pub fn fetch_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn next_response(&self, period: Period) -> FetchResult<Snapshot> {
        let response = match lock(&self.queued).pop_front() {
            Some(response) => response,
            None => lock(&self.fallback)
                .clone()
                .ok_or_else(|| FetchError::Transport("no snapshot scripted".to_string())),
        };
        response.map(|mut snapshot| {
            snapshot.period = period;
            snapshot
        })
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn fetch(&self, period: Period) -> FetchResult<Snapshot> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let response = self.next_response(period);
        self.completed.fetch_add(1, Ordering::SeqCst);
        response
    }
}
