//! Bidirectional API stream that reconnects on failure.
//!
//! A [`ResilientStream`] owns one receive loop. When a receive fails while the
//! stream is open, the loop re-dials through its [`StreamConnector`], replays
//! the handshake with the last server-assigned stream id so the service can
//! resume the session, and retries with exponential backoff until a receive
//! succeeds or the retry budget runs out. Exhausting the budget is terminal
//! and is reported through [`ResilientStream::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stellar_common::proto::{
    stream_request, stream_response, SatelliteCommands, StreamRequest, StreamResponse, Telemetry,
};
use stellar_common::Framing;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::error::StreamError;

pub type InboundStream = BoxStream<'static, Result<StreamResponse, tonic::Status>>;

/// One live connection: where to write requests and where responses arrive.
pub struct StreamConnection {
    pub outbound: mpsc::Sender<StreamRequest>,
    pub inbound: InboundStream,
}

/// Dials the service and opens a stream, writing `handshake` first.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, handshake: StreamRequest) -> Result<StreamConnection, StreamError>;
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Ground station or satellite the stream is opened for.
    pub target_id: String,
    pub accepted_framing: Vec<Framing>,
    /// Resume an earlier session. `None` requests a brand-new one.
    pub resume_stream_id: Option<String>,
    pub backoff: BackoffConfig,
}

/// Units delivered to the consumer of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Telemetry(Telemetry),
    Commands(SatelliteCommands),
}

enum Episode {
    Connected {
        connection: StreamConnection,
        first: Option<StreamResponse>,
    },
    Shutdown,
}

struct Shared {
    connector: Arc<dyn StreamConnector>,
    options: StreamOptions,
    closed: AtomicBool,
    shutdown: CancellationToken,
    loop_done: CancellationToken,
    outbound: Mutex<Option<mpsc::Sender<StreamRequest>>>,
    stream_id: Mutex<String>,
    terminal: Mutex<Option<StreamError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn handshake(&self, stream_id: &str) -> StreamRequest {
        StreamRequest {
            target_id: self.options.target_id.clone(),
            stream_id: stream_id.to_string(),
            accepted_framing: self
                .options
                .accepted_framing
                .iter()
                .map(|f| f.to_proto() as i32)
                .collect(),
            request: None,
        }
    }

    fn set_outbound(&self, outbound: Option<mpsc::Sender<StreamRequest>>) {
        *lock(&self.outbound) = outbound;
    }

    fn outbound(&self) -> Option<mpsc::Sender<StreamRequest>> {
        lock(&self.outbound).clone()
    }

    async fn attempt(
        &self,
        stream_id: &str,
        await_first: bool,
    ) -> Result<(StreamConnection, Option<StreamResponse>), StreamError> {
        let mut connection = self.connector.connect(self.handshake(stream_id)).await?;
        if !await_first {
            return Ok((connection, None));
        }

        match connection.inbound.next().await {
            Some(Ok(response)) => Ok((connection, Some(response))),
            Some(Err(status)) => Err(StreamError::Rpc(status)),
            None => Err(StreamError::EndOfStream),
        }
    }

    /// Run one backoff episode. The first attempt is immediate.
    async fn connect_episode(
        &self,
        backoff: &mut ExponentialBackoff,
        stream_id: &str,
        await_first: bool,
    ) -> Result<Episode, StreamError> {
        backoff.reset();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(Episode::Shutdown),
                result = self.attempt(stream_id, await_first) => result,
            };

            let err = match result {
                Ok((connection, first)) => return Ok(Episode::Connected { connection, first }),
                Err(err) => err,
            };

            if self.is_closed() {
                return Ok(Episode::Shutdown);
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(StreamError::RetryBudgetExhausted {
                    attempts,
                    elapsed: backoff.elapsed(),
                    last_error: err.to_string(),
                });
            };

            warn!("{}. Automatically retrying in {:?}", err, delay);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(Episode::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn recv_loop(
        &self,
        mut inbound: InboundStream,
        deliver: mpsc::Sender<Inbound>,
        mut stream_id: String,
    ) -> Result<(), StreamError> {
        let mut backoff = ExponentialBackoff::new(self.options.backoff.clone());

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                item = inbound.next() => item,
            };

            if self.is_closed() {
                return Ok(());
            }

            let response = match received {
                Some(Ok(response)) => response,
                failure => {
                    let err = match failure {
                        Some(Err(status)) => StreamError::Rpc(status),
                        _ => StreamError::EndOfStream,
                    };
                    warn!("{}", err);
                    info!("Reconnecting to the API stream (stream id '{}')", stream_id);
                    self.set_outbound(None);

                    match self.connect_episode(&mut backoff, &stream_id, true).await? {
                        Episode::Shutdown => return Ok(()),
                        Episode::Connected { connection, first } => {
                            info!("Connected to the API stream");
                            self.set_outbound(Some(connection.outbound));
                            inbound = connection.inbound;
                            match first {
                                Some(response) => response,
                                None => continue,
                            }
                        }
                    }
                }
            };

            if !response.stream_id.is_empty() && response.stream_id != stream_id {
                stream_id = response.stream_id.clone();
                *lock(&self.stream_id) = stream_id.clone();
                debug!("Stream id assigned: {}", stream_id);
            }

            let unit = match response.response {
                Some(stream_response::Response::Telemetry(telemetry)) => Inbound::Telemetry(telemetry),
                Some(stream_response::Response::Commands(commands)) => Inbound::Commands(commands),
                Some(stream_response::Response::Event(event)) => {
                    info!("Stream event for plan {}: {}", event.plan_id, event.message);
                    continue;
                }
                None => continue,
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                sent = deliver.send(unit) => {
                    if sent.is_err() {
                        debug!("Inbound consumer is gone, dropping unit");
                    }
                }
            }
        }
    }
}

/// A stream to the API that survives transient failures.
///
/// `send` may be called from any task. A send issued while a reconnect is in
/// progress fails with [`StreamError::Disconnected`] instead of racing the
/// connection swap.
pub struct ResilientStream {
    shared: Arc<Shared>,
    recv_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientStream {
    /// Open the stream and start its receive loop.
    ///
    /// The initial connection is retried under the same backoff budget as
    /// reconnects. Cancelling `parent` shuts the stream down like
    /// [`close`](Self::close).
    pub async fn open(
        connector: Arc<dyn StreamConnector>,
        options: StreamOptions,
        deliver: mpsc::Sender<Inbound>,
        parent: &CancellationToken,
    ) -> Result<Self, StreamError> {
        let stream_id = options.resume_stream_id.clone().unwrap_or_default();
        let shared = Arc::new(Shared {
            connector,
            options,
            closed: AtomicBool::new(false),
            shutdown: parent.child_token(),
            loop_done: CancellationToken::new(),
            outbound: Mutex::new(None),
            stream_id: Mutex::new(stream_id.clone()),
            terminal: Mutex::new(None),
        });

        info!("Opening API stream for {}", shared.options.target_id);

        let mut backoff = ExponentialBackoff::new(shared.options.backoff.clone());
        let connection = match shared.connect_episode(&mut backoff, &stream_id, false).await? {
            Episode::Connected { connection, .. } => connection,
            Episode::Shutdown => return Err(StreamError::Closed),
        };
        let StreamConnection { outbound, inbound } = connection;
        shared.set_outbound(Some(outbound));

        info!("API stream opened for {}", shared.options.target_id);

        let task_shared = shared.clone();
        let recv_loop = tokio::spawn(async move {
            // Fires on every exit path, unwinding included.
            let _done = task_shared.loop_done.clone().drop_guard();
            if let Err(e) = task_shared.recv_loop(inbound, deliver, stream_id).await {
                error!("API stream terminated: {}", e);
                *lock(&task_shared.terminal) = Some(e);
            }
            task_shared.set_outbound(None);
        });

        Ok(Self {
            shared,
            recv_loop: Mutex::new(Some(recv_loop)),
        })
    }

    /// Transmit one outbound unit.
    pub async fn send(&self, request: stream_request::Request) -> Result<(), StreamError> {
        if self.shared.is_closed() {
            return Err(StreamError::Closed);
        }

        let outbound = self.shared.outbound().ok_or(StreamError::Disconnected)?;
        outbound
            .send(StreamRequest {
                target_id: self.shared.options.target_id.clone(),
                request: Some(request),
                ..Default::default()
            })
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    /// Last stream id assigned by the service, empty before the first response.
    /// Pass it as `resume_stream_id` to pick the session up again later.
    pub fn stream_id(&self) -> String {
        lock(&self.shared.stream_id).clone()
    }

    /// True once [`close`](Self::close) has been called or the stream was dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the receive loop has exited, for whatever reason.
    pub async fn terminated(&self) {
        self.shared.loop_done.cancelled().await
    }

    /// Shut the stream down and wait for the receive loop to exit. No unit is
    /// delivered after this returns. Returns the terminal error if the loop
    /// had already given up reconnecting.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.set_outbound(None);
        self.shared.shutdown.cancel();

        let handle = lock(&self.recv_loop).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("API stream receive loop failed: {}", e);
                self.shared.set_outbound(None);
                lock(&self.shared.terminal).get_or_insert(StreamError::Aborted(e.to_string()));
            }
        }
        self.shared.loop_done.cancelled().await;

        info!("API stream closed for {}", self.shared.options.target_id);

        match lock(&self.shared.terminal).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ResilientStream {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.shutdown.cancel();
    }
}
