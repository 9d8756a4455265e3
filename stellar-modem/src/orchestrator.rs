//! Per-pass streaming sessions.
//!
//! The [`SessionOrchestrator`] receives pass transitions from the scheduler.
//! Each started pass gets its own [`Lifecycle`] running a session that waits
//! for AOS, opens a [`ResilientStream`], sends the satellite's payload once
//! per `send_interval` until LOS, then closes the stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stellar_common::proto::{stream_request, Telemetry};
use stellar_common::{to_timestamp, Framing, Pass};

use crate::backoff::BackoffConfig;
use crate::config::{GroundStationConfig, ModemConfig};
use crate::error::StreamError;
use crate::lifecycle::{Lifecycle, LifecycleTask};
use crate::scheduler::PassHandler;
use crate::stream::{Inbound, ResilientStream, StreamConnector, StreamOptions};

/// Inbound units buffered between the stream and the session's logger.
const INBOUND_BUFFER: usize = 64;

/// Bytes sent to a satellite's pass, and how they are framed.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub framing: Framing,
}

#[async_trait]
pub trait PayloadSource: Send + Sync + 'static {
    async fn payload_for(&self, pass: &Pass) -> anyhow::Result<Payload>;
}

/// Reads each satellite's configured telemetry file.
#[derive(Debug, Clone)]
pub struct FilePayloads {
    satellites: HashMap<String, (PathBuf, Framing)>,
    fallback: PathBuf,
}

impl FilePayloads {
    /// `fallback` is read, with bitstream framing, for satellites that are
    /// not listed.
    pub fn new(fallback: impl Into<PathBuf>) -> Self {
        Self {
            satellites: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    /// Send `file` with `framing` during passes of satellite `id`.
    pub fn with_satellite(mut self, id: impl Into<String>, file: impl Into<PathBuf>, framing: Framing) -> Self {
        self.satellites.insert(id.into(), (file.into(), framing));
        self
    }

    pub fn from_config(config: &ModemConfig) -> Self {
        config
            .satellites
            .iter()
            .fold(Self::new("data.bin"), |payloads, sat| {
                payloads.with_satellite(sat.id.clone(), sat.telemetry.clone(), sat.framing)
            })
    }
}

#[async_trait]
impl PayloadSource for FilePayloads {
    async fn payload_for(&self, pass: &Pass) -> anyhow::Result<Payload> {
        let (path, framing) = match self.satellites.get(&pass.satellite_id) {
            Some((path, framing)) => (path, *framing),
            None => {
                debug!("Satellite {} is not configured, using {}", pass.satellite_id, self.fallback.display());
                (&self.fallback, Framing::default())
            }
        };

        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read telemetry file {}", path.display()))?;

        Ok(Payload { data, framing })
    }
}

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Sent as the stream handshake's target.
    pub ground_station_id: String,
    pub accepted_framing: Vec<Framing>,
    pub backoff: BackoffConfig,
    pub send_interval: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &ModemConfig, ground_station: &GroundStationConfig) -> Self {
        Self {
            ground_station_id: ground_station.id.clone(),
            accepted_framing: config.accepted_framings(),
            backoff: config.stream.clone(),
            send_interval: config.send_interval(),
        }
    }
}

#[derive(Clone)]
struct Session {
    lifecycle: Arc<Lifecycle>,
    /// Cancelled when the pass ends, even if the lifecycle has not started yet.
    ended: CancellationToken,
    /// Fires once the session task has closed its stream.
    finished: CancellationToken,
}

impl Session {
    fn new() -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new()),
            ended: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    fn stop(&self) {
        self.ended.cancel();
        self.lifecycle.stop();
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Session>,
    /// Sessions already told to stop that may still be closing.
    retiring: Vec<CancellationToken>,
}

pub struct SessionOrchestrator {
    connector: Arc<dyn StreamConnector>,
    payloads: Arc<dyn PayloadSource>,
    options: Arc<SessionOptions>,
    registry: Mutex<Registry>,
}

impl SessionOrchestrator {
    /// Sessions open streams through `connector` and send what `payloads`
    /// returns for their pass.
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        payloads: Arc<dyn PayloadSource>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            payloads,
            options: Arc::new(options),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ids of passes with a registered session.
    pub fn active_passes(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.registry().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every session.
    pub fn stop_all(&self) {
        let mut registry = self.registry();
        let sessions: Vec<_> = registry.active.drain().collect();
        for (id, session) in sessions {
            debug!("Stopping session for pass {}", id);
            session.stop();
            registry.retiring.push(session.finished);
        }
    }

    /// Claim `pass` in the registry. `None` if a session already runs for it.
    fn register(&self, pass: &Pass) -> Option<Session> {
        let mut registry = self.registry();
        if registry.active.contains_key(&pass.id) {
            info!("Session for pass {} is already running", pass.id);
            return None;
        }
        let session = Session::new();
        registry.active.insert(pass.id.clone(), session.clone());
        Some(session)
    }

    /// Start the session task for a registered pass. A pass that ended in the
    /// meantime starts already cancelled and exits without connecting.
    async fn launch(&self, pass: Pass, session: Session) {
        session
            .lifecycle
            .start(PassSession {
                pass,
                connector: self.connector.clone(),
                payloads: self.payloads.clone(),
                options: self.options.clone(),
                ended: session.ended.clone(),
                finished: session.finished.clone(),
            })
            .await;
        // `ended` fires before `Session::stop` touches the lifecycle, so a stop
        // that arrived while starting is either seen here or lands after start.
        if session.ended.is_cancelled() {
            session.lifecycle.stop();
        }
    }

    /// Wait until every stopped session has closed its stream.
    pub async fn wait_all(&self) {
        let retiring = std::mem::take(&mut self.registry().retiring);
        for finished in retiring {
            finished.cancelled().await;
        }
    }
}

#[async_trait]
impl PassHandler for SessionOrchestrator {
    async fn on_pass_start(&self, pass: Pass) {
        if let Some(session) = self.register(&pass) {
            self.launch(pass, session).await;
        }
    }

    async fn on_pass_end(&self, pass: Pass) {
        let mut registry = self.registry();
        let Some(session) = registry.active.remove(&pass.id) else {
            info!("No session running for pass {}", pass.id);
            return;
        };
        session.stop();
        registry.retiring.retain(|finished| !finished.is_cancelled());
        registry.retiring.push(session.finished);
    }
}

struct PassSession {
    pass: Pass,
    connector: Arc<dyn StreamConnector>,
    payloads: Arc<dyn PayloadSource>,
    options: Arc<SessionOptions>,
    ended: CancellationToken,
    finished: CancellationToken,
}

impl LifecycleTask for PassSession {
    fn on_start(&self, cancel: CancellationToken) {
        info!("Starting session. {}", self.pass);

        // The session stops on either the lifecycle token or the pass ending.
        let session_cancel = self.ended.child_token();
        let linked = session_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });

        tokio::spawn(run_session(
            self.pass.clone(),
            self.connector.clone(),
            self.payloads.clone(),
            self.options.clone(),
            session_cancel,
            self.finished.clone(),
        ));
    }

    fn on_stop(&self) {
        info!("Stopping session for pass {}", self.pass.id);
    }
}

/// Monotonic deadline for a wall-clock time, clamped to now if it has passed.
fn deadline(at: chrono::DateTime<Utc>) -> Instant {
    Instant::now() + (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn run_session(
    pass: Pass,
    connector: Arc<dyn StreamConnector>,
    payloads: Arc<dyn PayloadSource>,
    options: Arc<SessionOptions>,
    cancel: CancellationToken,
    finished: CancellationToken,
) {
    let _finished = finished.drop_guard();
    // Releases the token link once the session is over.
    let _cancel_on_exit = cancel.clone().drop_guard();
    if cancel.is_cancelled() {
        info!("Session for pass {} ended before it started", pass.id);
        return;
    }
    let aos = deadline(pass.aos);
    let los = deadline(pass.los);

    if aos > Instant::now() {
        info!("Waiting {:?} for AOS of pass {}", aos - Instant::now(), pass.id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Session for pass {} cancelled before AOS", pass.id);
                return;
            }
            _ = sleep_until(aos) => {}
        }
    }
    info!("AOS for pass {}", pass.id);

    let payload = match payloads.payload_for(&pass).await {
        Ok(payload) => payload,
        Err(e) => {
            error!("No payload for pass {}: {:#}", pass.id, e);
            return;
        }
    };

    let stream_options = StreamOptions {
        target_id: options.ground_station_id.clone(),
        accepted_framing: options.accepted_framing.clone(),
        resume_stream_id: None,
        backoff: options.backoff.clone(),
    };
    let (deliver, inbound) = mpsc::channel(INBOUND_BUFFER);
    let stream = match ResilientStream::open(connector, stream_options, deliver, &cancel).await {
        Ok(stream) => stream,
        Err(StreamError::Closed) => {
            info!("Session for pass {} cancelled while connecting", pass.id);
            return;
        }
        Err(e) => {
            error!("Could not open API stream for pass {}: {}", pass.id, e);
            return;
        }
    };
    let drain = tokio::spawn(log_inbound(pass.id.clone(), inbound));

    let mut ticker = interval_at(Instant::now(), options.send_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0usize;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Session for pass {} stopped", pass.id);
                break;
            }
            _ = stream.terminated() => break,
            _ = sleep_until(los) => {
                info!("LOS for pass {}", pass.id);
                break;
            }
            _ = ticker.tick() => {
                let now = to_timestamp(Utc::now());
                let telemetry = Telemetry {
                    plan_id: pass.id.clone(),
                    data: payload.data.clone(),
                    framing: payload.framing.to_proto() as i32,
                    time_first_byte_received: Some(now),
                    time_last_byte_received: Some(now),
                    downlink_frequency_hz: pass.downlink_frequency_hz,
                };
                // A stalled outbound queue must not hold the session past LOS.
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Session for pass {} stopped while sending", pass.id);
                        break;
                    }
                    _ = stream.terminated() => break,
                    _ = sleep_until(los) => {
                        info!("LOS for pass {} while sending", pass.id);
                        break;
                    }
                    result = stream.send(stream_request::Request::Telemetry(telemetry)) => result,
                };
                match result {
                    Ok(()) => {
                        sent += 1;
                        debug!("Sent {} bytes for pass {}", payload.data.len(), pass.id);
                    }
                    Err(StreamError::Disconnected) => debug!("Stream reconnecting, skipped a payload for pass {}", pass.id),
                    Err(e) => {
                        warn!("Sending for pass {} failed: {}", pass.id, e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = stream.close().await {
        error!("API stream for pass {} ended with error: {}", pass.id, e);
    }
    if let Err(e) = drain.await {
        error!("Inbound logger for pass {} failed: {}", pass.id, e);
    }
    info!("Session for pass {} finished after {} payloads", pass.id, sent);
}

async fn log_inbound(pass_id: String, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(unit) = inbound.recv().await {
        match unit {
            Inbound::Telemetry(telemetry) => info!(
                "Pass {}: received {} telemetry bytes for plan {}",
                pass_id,
                telemetry.data.len(),
                telemetry.plan_id
            ),
            Inbound::Commands(commands) => info!(
                "Pass {}: received {} commands for plan {}",
                pass_id,
                commands.command.len(),
                commands.plan_id
            ),
        }
    }
}
