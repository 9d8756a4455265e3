use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use stellar_common::proto::{
    ground_station_service_client::GroundStationServiceClient, ListPlansRequest, Plan,
    StreamRequest,
};
use stellar_common::to_timestamp;

use crate::error::StreamError;
use crate::scheduler::PassSource;
use crate::stream::{StreamConnection, StreamConnector};

/// Outbound requests buffered per stream before `send` waits.
const OUTBOUND_BUFFER: usize = 16;

/// Limit on establishing the TCP/TLS connection to the API.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit on a unary call, and on waiting for a stream's response headers.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn endpoint(address: &str) -> Result<Endpoint, tonic::transport::Error> {
    Ok(Endpoint::from_shared(address.to_string())?.connect_timeout(CONNECT_TIMEOUT))
}

/// Bearer credentials attached to every call.
#[derive(Clone)]
pub struct Credentials {
    bearer: String,
}

#[derive(Deserialize)]
struct KeyFile {
    api_key: String,
}

impl Credentials {
    pub fn new(bearer: impl Into<String>) -> Self {
        Self {
            bearer: bearer.into(),
        }
    }

    /// Load an API key file. Accepts either a JSON object with an `api_key`
    /// field or the raw key as plain text.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read API key file {}", path.display()))?;

        let bearer = match serde_json::from_str::<KeyFile>(&contents) {
            Ok(key) => key.api_key,
            Err(_) => contents.trim().to_string(),
        };
        anyhow::ensure!(!bearer.is_empty(), "API key file {} is empty", path.display());

        Ok(Self::new(bearer))
    }

    fn authorize<T>(&self, request: &mut Request<T>) -> Result<(), StreamError> {
        let value: MetadataValue<Ascii> = format!("Bearer {}", self.bearer)
            .parse()
            .map_err(|_| StreamError::Credentials("API key is not valid header text".to_string()))?;
        request.metadata_mut().insert("authorization", value);
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

/// gRPC client wrapper for the ground station API.
///
/// `GroundStationServiceClient<Channel>` is backed by one multiplexed H2
/// connection; clones share it, so each call clones the client rather than
/// taking `&mut self`.
#[derive(Clone)]
pub struct ApiClient {
    client: GroundStationServiceClient<Channel>,
    ground_station_id: String,
    credentials: Credentials,
    request_timeout: Duration,
}

impl ApiClient {
    /// Create a client that connects on first use.
    pub fn connect_lazy(address: &str, ground_station_id: String, credentials: Credentials) -> Result<Self> {
        let channel = endpoint(address)
            .with_context(|| format!("Invalid API address {}", address))?
            .connect_lazy();

        tracing::info!("API client for ground station {} targets {}", ground_station_id, address);

        Ok(Self {
            client: GroundStationServiceClient::new(channel),
            ground_station_id,
            credentials,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Give up on a `ListPlans` call after `timeout` instead of the default 30 s.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// List plans whose AOS falls inside `[aos_after, aos_before)`.
    pub async fn list_plans(&self, aos_after: DateTime<Utc>, aos_before: DateTime<Utc>) -> Result<Vec<Plan>> {
        let mut request = Request::new(ListPlansRequest {
            ground_station_id: self.ground_station_id.clone(),
            aos_after: Some(to_timestamp(aos_after)),
            aos_before: Some(to_timestamp(aos_before)),
        });
        self.credentials.authorize(&mut request)?;

        tracing::debug!("ListPlans request: {:?}", request.get_ref());

        let mut client = self.client.clone();
        let response = tokio::time::timeout(self.request_timeout, client.list_plans(request))
            .await
            .map_err(|_| anyhow::anyhow!("ListPlans timed out after {:?}", self.request_timeout))?
            .context("ListPlans call failed")?;

        Ok(response.into_inner().plan)
    }
}

#[async_trait]
impl PassSource for ApiClient {
    async fn list_plans(&self, aos_after: DateTime<Utc>, aos_before: DateTime<Utc>) -> Result<Vec<Plan>> {
        ApiClient::list_plans(self, aos_after, aos_before).await
    }
}

/// Opens API streams over a fresh connection each time, so a reconnect
/// really re-dials the endpoint.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    address: String,
    credentials: Credentials,
    open_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            credentials,
            open_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Limit on dialing and waiting for the service to answer `OpenStream`.
    /// The stream itself has no deadline.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[async_trait]
impl StreamConnector for GrpcConnector {
    async fn connect(&self, handshake: StreamRequest) -> Result<StreamConnection, StreamError> {
        tokio::time::timeout(self.open_timeout, self.open(handshake))
            .await
            .map_err(|_| {
                StreamError::Rpc(Status::deadline_exceeded(format!(
                    "OpenStream not answered within {:?}",
                    self.open_timeout
                )))
            })?
    }
}

impl GrpcConnector {
    async fn open(&self, handshake: StreamRequest) -> Result<StreamConnection, StreamError> {
        let connect_err = |source| StreamError::Connect {
            endpoint: self.address.clone(),
            source,
        };

        let channel = endpoint(&self.address)
            .map_err(connect_err)?
            .connect()
            .await
            .map_err(connect_err)?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tx.send(handshake).await.map_err(|_| StreamError::Handshake)?;

        let mut request = Request::new(ReceiverStream::new(rx));
        self.credentials.authorize(&mut request)?;

        let response = GroundStationServiceClient::new(channel)
            .open_stream(request)
            .await?;

        Ok(StreamConnection {
            outbound: tx,
            inbound: response.into_inner().boxed(),
        })
    }
}
