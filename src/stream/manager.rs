//! Supervision of one event-stream lifetime per token.
//!
//! A `StreamManager` is bound to a single token. It opens the stream, reads
//! frames on a background task, and when the stream ends runs the reconnect
//! sequence described by its [`ReconnectPolicy`]. Once the retry budget is
//! spent it sends [`StreamSignal::TokenInvalid`] exactly once and stops;
//! recovery from there belongs to the session.
//!
//! Phases: `Disconnected -> Connecting -> Streaming -> Reconnecting -> ...`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Response;
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::{ReconnectPolicy, RetryState};
use crate::rpc::DispatchError;
use crate::stream::client::{StreamClient, StreamConnectError};
use crate::stream::frame::FrameReader;

/// Consumer of stream payloads.
///
/// Called on the reader task, one frame at a time, in arrival order. Errors
/// are logged by the manager and never end the stream.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle_frame<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<(), DispatchError>>;
}

/// Notifications sent from a manager to its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSignal {
    /// Reconnects were exhausted; the manager's token should be replaced.
    TokenInvalid { epoch: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

/// Exactly one in-flight connection.
struct StreamHandle {
    id: u64,
    cancel: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

impl StreamHandle {
    fn release(self) {
        let _ = self.cancel.send(true);
    }
}

struct ManagerState {
    phase: StreamPhase,
    handle: Option<StreamHandle>,
    next_connection_id: u64,
}

struct Inner {
    client: StreamClient,
    token: SecretString,
    epoch: u64,
    policy: ReconnectPolicy,
    handler: Arc<dyn FrameHandler>,
    signals: mpsc::UnboundedSender<StreamSignal>,
    state: Mutex<ManagerState>,
    generation: watch::Sender<u64>,
}

enum ReadOutcome {
    Cancelled,
    Ended,
}

/// Cloneable handle to one token's stream lifecycle.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    /// Creates a disconnected manager.
    ///
    /// `epoch` is echoed in every signal so the owner can ignore managers it
    /// has already replaced.
    pub fn new(
        client: StreamClient,
        token: SecretString,
        handler: Arc<dyn FrameHandler>,
        policy: ReconnectPolicy,
        epoch: u64,
        signals: mpsc::UnboundedSender<StreamSignal>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                client,
                token,
                epoch,
                policy,
                handler,
                signals,
                state: Mutex::new(ManagerState {
                    phase: StreamPhase::Disconnected,
                    handle: None,
                    next_connection_id: 0,
                }),
                generation,
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn phase(&self) -> StreamPhase {
        self.state().phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase() == StreamPhase::Streaming
    }

    /// Opens the stream and starts the reader task.
    ///
    /// Tears down any existing connection and stops an in-flight reconnect
    /// sequence first. Does not retry.
    pub async fn connect(&self) -> Result<(), StreamConnectError> {
        let generation = {
            let _state = self.state();
            self.bump_generation()
        };
        self.open_stream(StreamPhase::Connecting, generation).await
    }

    /// Stops reading and reconnecting.
    ///
    /// Idempotent and safe from any phase. The reader task observes the
    /// cancellation at its next frame boundary and drops the connection.
    pub fn disconnect(&self) {
        let handle = {
            let mut state = self.state();
            self.bump_generation();
            state.phase = StreamPhase::Disconnected;
            state.handle.take()
        };
        if let Some(handle) = handle {
            debug!(event = "stream_disconnected", epoch = self.inner.epoch, connection = handle.id);
            handle.release();
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the state lock so phase and generation move together.
    fn bump_generation(&self) -> u64 {
        self.inner.generation.send_modify(|generation| *generation += 1);
        *self.inner.generation.borrow()
    }

    fn current_generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    async fn open_stream(
        &self,
        phase: StreamPhase,
        generation: u64,
    ) -> Result<(), StreamConnectError> {
        let previous = {
            let mut state = self.state();
            if self.current_generation() != generation {
                return Err(StreamConnectError::Cancelled);
            }
            state.phase = phase;
            state.handle.take()
        };
        if let Some(previous) = previous {
            previous.release();
        }

        let result = self.inner.client.open(&self.inner.token).await;

        let mut state = self.state();
        if self.current_generation() != generation {
            return Err(StreamConnectError::Cancelled);
        }

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if phase == StreamPhase::Connecting {
                    state.phase = StreamPhase::Disconnected;
                }
                return Err(err);
            }
        };

        if let Some(stale) = state.handle.take() {
            stale.release();
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (cancel, cancel_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(manager.run_connection(id, response, cancel_rx));
        state.handle = Some(StreamHandle {
            id,
            cancel,
            _task: task,
        });
        state.phase = StreamPhase::Streaming;
        info!(event = "stream_connected", epoch = self.inner.epoch, connection = id);
        Ok(())
    }

    /// Reader task body. Boxed because reconnecting spawns another reader.
    fn run_connection(
        self,
        id: u64,
        response: Response,
        mut cancel: watch::Receiver<bool>,
    ) -> BoxFuture<'static, ()> {
        async move {
            match self.read_frames(response, &mut cancel).await {
                ReadOutcome::Cancelled => {
                    debug!(event = "stream_reader_stopped", epoch = self.inner.epoch, connection = id);
                }
                ReadOutcome::Ended => {
                    let owned = {
                        let mut state = self.state();
                        if state.handle.as_ref().map(|handle| handle.id) == Some(id) {
                            state.handle = None;
                            state.phase = StreamPhase::Reconnecting;
                            Some(self.current_generation())
                        } else {
                            None
                        }
                    };
                    if let Some(generation) = owned {
                        warn!(event = "stream_ended", epoch = self.inner.epoch, connection = id);
                        self.reconnect(generation).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn read_frames(
        &self,
        response: Response,
        cancel: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let mut reader = FrameReader::new(Box::pin(response.bytes_stream()));
        loop {
            if *cancel.borrow() {
                return ReadOutcome::Cancelled;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.changed() => return ReadOutcome::Cancelled,
                frame = reader.next_frame() => frame,
            };

            match next {
                Ok(Some(payload)) => {
                    if *cancel.borrow() {
                        return ReadOutcome::Cancelled;
                    }
                    debug!(event = "stream_frame_received", epoch = self.inner.epoch, bytes = payload.len());
                    if let Err(err) = self.inner.handler.handle_frame(&payload).await {
                        error!(event = "frame_dispatch_failed", epoch = self.inner.epoch, error = %err);
                    }
                }
                Ok(None) => return ReadOutcome::Ended,
                Err(err) => {
                    warn!(event = "stream_read_failed", epoch = self.inner.epoch, error = %err);
                    return ReadOutcome::Ended;
                }
            }
        }
    }

    /// Runs the reconnect sequence for the connection that ended at `generation`.
    ///
    /// A disconnect or connect since then moved the generation, and the
    /// sequence stops without reopening or signalling.
    async fn reconnect(&self, generation: u64) {
        let mut generation_rx = self.inner.generation.subscribe();
        if *generation_rx.borrow_and_update() != generation {
            debug!(event = "stream_reconnect_superseded", epoch = self.inner.epoch);
            return;
        }
        let policy = &self.inner.policy;

        if !policy.is_immediate() {
            if !sleep_unless_changed(policy.settle_delay, &mut generation_rx).await {
                return;
            }

            let mut retry = RetryState::default();
            loop {
                match self.open_stream(StreamPhase::Reconnecting, generation).await {
                    Ok(()) => {
                        info!(
                            event = "stream_reconnected",
                            epoch = self.inner.epoch,
                            attempts = retry.attempt + 1
                        );
                        return;
                    }
                    Err(StreamConnectError::Cancelled) => return,
                    Err(err) => {
                        let wait = retry.record_failure(policy);
                        error!(
                            event = "stream_reconnect_failed",
                            epoch = self.inner.epoch,
                            attempt = retry.attempt,
                            max_attempts = policy.max_attempts,
                            error = %err
                        );
                        let Some(delay) = wait else {
                            break;
                        };
                        debug!(
                            event = "stream_reconnect_waiting",
                            epoch = self.inner.epoch,
                            delay_ms = delay.as_millis() as u64
                        );
                        if !sleep_unless_changed(delay, &mut generation_rx).await {
                            return;
                        }
                    }
                }
            }
        }

        {
            let mut state = self.state();
            if self.current_generation() != generation {
                return;
            }
            state.phase = StreamPhase::Disconnected;
        }
        warn!(event = "stream_token_invalid", epoch = self.inner.epoch);
        let _ = self.inner.signals.send(StreamSignal::TokenInvalid {
            epoch: self.inner.epoch,
        });
    }
}

/// Sleeps for `delay` unless the generation moves first.
///
/// Returns `false` when the sleep was interrupted.
async fn sleep_unless_changed(delay: Duration, generation: &mut watch::Receiver<u64>) -> bool {
    if delay.is_zero() {
        return !generation.has_changed().unwrap_or(true);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = generation.changed() => false,
    }
}
