use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::api::{ApiClient, Credentials, GrpcConnector};
use crate::config::ModemConfig;
use crate::orchestrator::{FilePayloads, SessionOptions, SessionOrchestrator};
use crate::scheduler::{PassHandler, PassScheduler, PassSource};

/// Drives one ground station: the scheduler discovers passes and the
/// orchestrator streams during them.
pub struct Modem {
    name: String,
    scheduler: PassScheduler,
    orchestrator: Arc<SessionOrchestrator>,
    poll_interval: Duration,
}

impl Modem {
    /// Build a modem from its parts. `poll_interval` is how often `source`
    /// is asked for plans.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn PassSource>,
        orchestrator: Arc<SessionOrchestrator>,
        lookback: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            scheduler: PassScheduler::new(source, lookback),
            orchestrator,
            poll_interval,
        }
    }

    /// Wire up the API client, stream connector and payloads for the selected
    /// ground station.
    pub fn from_config(config: &ModemConfig, requested: Option<&str>) -> anyhow::Result<Self> {
        let station = config.select_ground_station(requested)?;
        info!("Using ground station {} ({})", station.name, station.id);

        let credentials = Credentials::from_key_file(&station.key)
            .with_context(|| format!("Failed to load credentials for ground station {}", station.name))?;
        let client = ApiClient::connect_lazy(&station.address, station.id.clone(), credentials.clone())?;
        let connector = GrpcConnector::new(station.address.clone(), credentials);

        let orchestrator = SessionOrchestrator::new(
            Arc::new(connector),
            Arc::new(FilePayloads::from_config(config)),
            SessionOptions::from_config(config, station),
        );

        Ok(Self::new(
            station.name.clone(),
            Arc::new(client),
            Arc::new(orchestrator),
            station.lookback,
            station.plan_update_interval(),
        ))
    }

    /// The orchestrator receiving this modem's pass transitions.
    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    /// Start polling for passes. Sessions start and stop on their own as
    /// passes begin and end.
    pub async fn start(&self) {
        info!("Starting modem for ground station {}", self.name);
        let handler: Arc<dyn PassHandler> = self.orchestrator.clone();
        self.scheduler.start(self.poll_interval, handler).await;
    }

    /// Stop discovering passes and stop every running session.
    pub fn stop(&self) {
        info!("Stopping modem for ground station {}", self.name);
        self.scheduler.stop();
        self.orchestrator.stop_all();
    }

    /// Wait for the scheduler and all stopped sessions to wind down.
    pub async fn wait(&self) {
        self.scheduler.wait().await;
        self.orchestrator.wait_all().await;
        info!("Modem for ground station {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Payload, PayloadSource};
    use crate::stream::tests::{Scripted, ScriptedConnector};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::io::Write;
    use stellar_common::proto::Plan;
    use stellar_common::{Framing, Pass};

    struct OnePass(Plan);

    #[async_trait]
    impl PassSource for OnePass {
        async fn list_plans(&self, _after: DateTime<Utc>, _before: DateTime<Utc>) -> anyhow::Result<Vec<Plan>> {
            Ok(vec![self.0.clone()])
        }
    }

    struct Bytes;

    #[async_trait]
    impl PayloadSource for Bytes {
        async fn payload_for(&self, _pass: &Pass) -> anyhow::Result<Payload> {
            Ok(Payload {
                data: b"beacon".to_vec(),
                framing: Framing::Bitstream,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_pass_streams_until_stop() {
        let now = Utc::now();
        let secs = chrono::Duration::seconds;
        let pass = Pass::new("P1", "sat-1", now - secs(30), now - secs(20), now + secs(600), now + secs(610)).unwrap();

        let connector = ScriptedConnector::new(vec![Scripted::Accept {
            responses: vec![],
            hold_open: true,
        }]);
        let orchestrator = Arc::new(SessionOrchestrator::new(
            connector.clone(),
            Arc::new(Bytes),
            SessionOptions {
                ground_station_id: "gs-1".to_string(),
                accepted_framing: vec![Framing::Bitstream],
                backoff: Default::default(),
                send_interval: Duration::from_secs(1),
            },
        ));
        let modem = Modem::new(
            "north",
            Arc::new(OnePass(pass.to_proto())),
            orchestrator,
            true,
            Duration::from_secs(300),
        );

        modem.start().await;
        while connector.connects() == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(modem.orchestrator().active_passes(), vec!["P1"]);

        modem.stop();
        modem.wait().await;
        assert!(modem.orchestrator().active_passes().is_empty());

        // The session closed its stream, so the outbound side is finished.
        let mut outbound = connector.sent.lock().unwrap().remove(0);
        while outbound.recv().await.is_some() {}
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn test_from_config_requires_key_file() {
        let config = ModemConfig::parse(
            r#"
[[ground_stations]]
name = "north"
id = "gs-1"
address = "http://127.0.0.1:50051"
key = "/nonexistent/api.key"
"#,
        )
        .unwrap();
        assert!(Modem::from_config(&config, None).is_err());
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"secret").unwrap();

        let config = ModemConfig::parse(&format!(
            r#"
[[ground_stations]]
name = "north"
id = "gs-1"
address = "http://127.0.0.1:50051"
key = "{}"
plan_update_interval_minutes = 3
"#,
            key.path().display()
        ))
        .unwrap();

        let modem = Modem::from_config(&config, Some("north")).unwrap();
        assert_eq!(modem.poll_interval, Duration::from_secs(180));
        assert_eq!(Modem::from_config(&config, Some("south")).unwrap().name, "north");
    }
}
