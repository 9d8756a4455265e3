pub mod auth;
pub mod config;
pub mod schedule;
pub mod service;

use std::sync::Arc;

use tonic::service::interceptor::InterceptedService;
use tonic::{Request, Status};

use stellar_common::proto::ground_station_service_server::GroundStationServiceServer;

use auth::ApiKeyAuthorizer;
use config::FakeServerConfig;
use service::FakeGroundStationService;

/// The fake service wrapped in its API key check, ready for `add_service`.
pub fn ground_station_service(
    config: Arc<FakeServerConfig>,
) -> InterceptedService<
    GroundStationServiceServer<FakeGroundStationService>,
    impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone,
> {
    let authorizer = ApiKeyAuthorizer::new(config.api_key.clone());
    GroundStationServiceServer::with_interceptor(
        FakeGroundStationService::new(config),
        move |request: Request<()>| authorizer.authorize(request),
    )
}
