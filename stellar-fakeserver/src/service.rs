use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use stellar_common::proto::{
    ground_station_service_server::GroundStationService, stream_request, stream_response,
    ListPlansRequest, ListPlansResponse, SatelliteCommands, StreamEvent, StreamRequest,
    StreamResponse, Telemetry,
};
use stellar_common::{from_timestamp, to_timestamp, Framing};

use crate::config::FakeServerConfig;
use crate::schedule::plans_between;

/// Longest AOS window `ListPlans` accepts.
const MAX_WINDOW_DAYS: i64 = 31;

/// Responses buffered per stream.
const RESPONSE_BUFFER: usize = 100;

pub struct FakeGroundStationService {
    config: Arc<FakeServerConfig>,
}

impl FakeGroundStationService {
    pub fn new(config: Arc<FakeServerConfig>) -> Self {
        Self { config }
    }
}

#[tonic::async_trait]
impl GroundStationService for FakeGroundStationService {
    async fn list_plans(
        &self,
        request: Request<ListPlansRequest>,
    ) -> Result<Response<ListPlansResponse>, Status> {
        let req = request.into_inner();

        if req.ground_station_id.is_empty() {
            return Err(Status::invalid_argument("ground_station_id not set"));
        }
        let aos_after = req
            .aos_after
            .as_ref()
            .and_then(from_timestamp)
            .ok_or_else(|| Status::invalid_argument("aos_after not set"))?;
        let aos_before = req
            .aos_before
            .as_ref()
            .and_then(from_timestamp)
            .ok_or_else(|| Status::invalid_argument("aos_before not set"))?;
        if aos_before - aos_after > chrono::Duration::days(MAX_WINDOW_DAYS) {
            return Err(Status::invalid_argument(format!(
                "window between aos_after and aos_before exceeds {} days",
                MAX_WINDOW_DAYS
            )));
        }

        let plan = plans_between(&self.config.schedule, &req.ground_station_id, aos_after, aos_before);
        info!(
            "ListPlans for {}: {} plans between {} and {}",
            req.ground_station_id,
            plan.len(),
            aos_after.format("%H:%M:%S"),
            aos_before.format("%H:%M:%S")
        );

        Ok(Response::new(ListPlansResponse { plan }))
    }

    type OpenStreamStream = ReceiverStream<Result<StreamResponse, Status>>;

    async fn open_stream(
        &self,
        request: Request<Streaming<StreamRequest>>,
    ) -> Result<Response<Self::OpenStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let handshake = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before handshake"))?;
        if handshake.target_id.is_empty() {
            return Err(Status::invalid_argument("handshake target_id not set"));
        }

        let stream_id = if handshake.stream_id.is_empty() {
            let id = uuid::Uuid::now_v7().to_string();
            info!("New stream {} for {}", id, handshake.target_id);
            id
        } else {
            info!("Resuming stream {} for {}", handshake.stream_id, handshake.target_id);
            handshake.stream_id.clone()
        };

        let framings: Vec<Framing> = handshake
            .accepted_framing
            .iter()
            .filter_map(|f| Framing::from_wire(*f))
            .collect();
        debug!("Stream {} accepts framings {:?}", stream_id, framings);

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let session = StreamSession {
            stream_id,
            target_id: handshake.target_id,
            framing: framings.first().copied().unwrap_or_default(),
            config: self.config.clone(),
            plan_id: String::new(),
            sequence: 0,
        };
        tokio::spawn(session.run(inbound, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn periodic(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| interval_at(Instant::now() + period, period))
}

enum Step {
    Request(Result<Option<StreamRequest>, Status>),
    Commands,
    Telemetry,
    Timeout,
    ClientGone,
}

struct StreamSession {
    stream_id: String,
    target_id: String,
    framing: Framing,
    config: Arc<FakeServerConfig>,
    /// Plan named in the most recent telemetry from the client.
    plan_id: String,
    sequence: u64,
}

impl StreamSession {
    fn response(&self, response: stream_response::Response) -> StreamResponse {
        StreamResponse {
            stream_id: self.stream_id.clone(),
            response: Some(response),
        }
    }

    fn next_commands(&mut self) -> StreamResponse {
        self.sequence += 1;
        self.response(stream_response::Response::Commands(SatelliteCommands {
            plan_id: self.plan_id.clone(),
            command: vec![format!("PING {}", self.sequence).into_bytes()],
        }))
    }

    fn telemetry(&self, data: Vec<u8>) -> StreamResponse {
        let now = Utc::now();
        self.response(stream_response::Response::Telemetry(Telemetry {
            plan_id: self.plan_id.clone(),
            data,
            framing: self.framing.to_proto() as i32,
            time_first_byte_received: Some(to_timestamp(now)),
            time_last_byte_received: Some(to_timestamp(now + chrono::Duration::seconds(1))),
            downlink_frequency_hz: self.config.schedule.downlink_frequency_hz,
        }))
    }

    fn synthetic_telemetry(&mut self) -> StreamResponse {
        self.sequence += 1;
        let seed = self.sequence as u8;
        let data = (0..self.config.session.telemetry_payload_size)
            .map(|i| seed.wrapping_add(i as u8))
            .collect();
        self.telemetry(data)
    }

    /// Handle one client request. Returns responses to send back.
    fn handle(&mut self, request: StreamRequest) -> Vec<StreamResponse> {
        match request.request {
            Some(stream_request::Request::Telemetry(telemetry)) => {
                info!(
                    "Stream {}: received {} bytes of telemetry for plan {}",
                    self.stream_id,
                    telemetry.data.len(),
                    telemetry.plan_id
                );
                self.plan_id = telemetry.plan_id;
                Vec::new()
            }
            Some(stream_request::Request::Commands(commands)) => {
                // Commands are looped back as telemetry, as if the satellite echoed them.
                info!(
                    "Stream {}: echoing {} commands for plan {}",
                    self.stream_id,
                    commands.command.len(),
                    commands.plan_id
                );
                commands
                    .command
                    .into_iter()
                    .map(|command| self.telemetry(command))
                    .collect()
            }
            None => {
                debug!("Stream {}: empty request", self.stream_id);
                Vec::new()
            }
        }
    }

    async fn run(mut self, mut inbound: Streaming<StreamRequest>, tx: mpsc::Sender<Result<StreamResponse, Status>>) {
        let opened = self.response(stream_response::Response::Event(StreamEvent {
            plan_id: String::new(),
            message: format!("Stream {} opened for {}", self.stream_id, self.target_id),
        }));
        if tx.send(Ok(opened)).await.is_err() {
            return;
        }

        let session = &self.config.session;
        let mut commands = periodic(session.command_interval());
        let mut telemetry = periodic(session.telemetry_interval());
        let deadline = session.session_timeout().map(|timeout| Instant::now() + timeout);

        loop {
            let step = tokio::select! {
                message = inbound.message() => Step::Request(message),
                _ = tick(&mut commands) => Step::Commands,
                _ = tick(&mut telemetry) => Step::Telemetry,
                _ = expire(deadline) => Step::Timeout,
                _ = tx.closed() => Step::ClientGone,
            };

            let responses = match step {
                Step::Request(Ok(Some(request))) => self.handle(request),
                Step::Request(Ok(None)) => {
                    info!("Stream {} closed by client", self.stream_id);
                    break;
                }
                Step::Request(Err(status)) => {
                    warn!("Stream {} failed: {}", self.stream_id, status);
                    break;
                }
                Step::Commands => vec![self.next_commands()],
                Step::Telemetry => vec![self.synthetic_telemetry()],
                Step::Timeout => {
                    info!("Stream {} reached its session timeout", self.stream_id);
                    let _ = tx.send(Err(Status::cancelled("session timeout"))).await;
                    break;
                }
                Step::ClientGone => {
                    info!("Stream {} dropped by client", self.stream_id);
                    break;
                }
            };

            for response in responses {
                if tx.send(Ok(response)).await.is_err() {
                    info!("Stream {} dropped by client", self.stream_id);
                    return;
                }
            }
        }
    }
}
