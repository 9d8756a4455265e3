//! Standalone stream monitor.
//!
//! Opens one API stream for a satellite and logs whatever arrives until it is
//! cancelled or the stream gives up. An earlier session can be picked up by
//! passing its stream id.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use stellar_common::Framing;

use crate::backoff::BackoffConfig;
use crate::error::StreamError;
use crate::stream::{Inbound, ResilientStream, StreamConnector, StreamOptions};

const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub satellite_id: String,
    /// Only log units for this plan.
    pub plan_id: Option<String>,
    /// Stream id of an earlier session to resume on the first connect.
    pub resume_stream_id: Option<String>,
    /// Keep reconnecting after the stream drops. Without it a drop gets one
    /// immediate resume attempt and then ends the monitor.
    pub reconnect: bool,
    pub accepted_framing: Vec<Framing>,
    pub backoff: BackoffConfig,
}

impl MonitorOptions {
    /// Fresh session, no plan filter, no reconnects.
    pub fn new(satellite_id: impl Into<String>) -> Self {
        Self {
            satellite_id: satellite_id.into(),
            plan_id: None,
            resume_stream_id: None,
            reconnect: false,
            accepted_framing: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Options for the underlying [`ResilientStream`]. Without `reconnect`
    /// the retry budget is zero.
    pub fn stream_options(&self) -> StreamOptions {
        let mut backoff = self.backoff.clone();
        if !self.reconnect {
            backoff.max_elapsed_secs = 0;
        }
        StreamOptions {
            target_id: self.satellite_id.clone(),
            accepted_framing: self.accepted_framing.clone(),
            resume_stream_id: self.resume_stream_id.clone().filter(|id| !id.is_empty()),
            backoff,
        }
    }

    fn wants(&self, plan_id: &str) -> bool {
        self.plan_id.as_deref().is_none_or(|wanted| wanted == plan_id)
    }
}

/// Stream until `cancel` fires or the stream terminates. Returns the number of
/// units logged.
pub async fn run_monitor(
    connector: Arc<dyn StreamConnector>,
    options: MonitorOptions,
    cancel: CancellationToken,
) -> Result<usize, StreamError> {
    let (deliver, mut inbound) = mpsc::channel(INBOUND_BUFFER);
    let stream = ResilientStream::open(connector, options.stream_options(), deliver, &cancel).await?;
    info!("Monitoring satellite {}", options.satellite_id);

    let mut logged = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Monitor stopped, resume with stream id {}", stream.stream_id());
                break;
            }
            unit = inbound.recv() => match unit {
                Some(unit) => {
                    if log_unit(&options, &unit) {
                        logged += 1;
                    }
                }
                None => break,
            },
        }
    }

    stream.close().await?;
    Ok(logged)
}

fn log_unit(options: &MonitorOptions, unit: &Inbound) -> bool {
    match unit {
        Inbound::Telemetry(telemetry) if options.wants(&telemetry.plan_id) => {
            info!(
                "Telemetry for plan {}: {} bytes",
                telemetry.plan_id,
                telemetry.data.len()
            );
            true
        }
        Inbound::Commands(commands) if options.wants(&commands.plan_id) => {
            info!(
                "Commands for plan {}: {} commands",
                commands.plan_id,
                commands.command.len()
            );
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::{telemetry_response, Scripted, ScriptedConnector};
    use std::time::Duration;

    #[test]
    fn test_stream_options() {
        let mut options = MonitorOptions::new("sat-1");
        let stream = options.stream_options();
        assert_eq!(stream.target_id, "sat-1");
        assert_eq!(stream.resume_stream_id, None);
        assert_eq!(stream.backoff.max_elapsed_secs, 0);

        options.reconnect = true;
        options.resume_stream_id = Some("S-1".to_string());
        let stream = options.stream_options();
        assert_eq!(stream.resume_stream_id.as_deref(), Some("S-1"));
        assert_eq!(stream.backoff.max_elapsed_secs, 60);

        options.resume_stream_id = Some(String::new());
        assert_eq!(options.stream_options().resume_stream_id, None);
    }

    #[test]
    fn test_plan_filter() {
        let mut options = MonitorOptions::new("sat-1");
        assert!(options.wants("P1"));
        options.plan_id = Some("P2".to_string());
        assert!(!options.wants("P1"));
        assert!(options.wants("P2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_given_stream_until_cancelled() {
        let connector = ScriptedConnector::new(vec![Scripted::Accept {
            responses: vec![telemetry_response("S-earlier", "P1")],
            hold_open: true,
        }]);
        let mut options = MonitorOptions::new("sat-1");
        options.resume_stream_id = Some("S-earlier".to_string());

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(run_monitor(connector.clone(), options, cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let logged = monitor.await.unwrap().unwrap();
        assert_eq!(logged, 1);
        assert_eq!(connector.handshake_ids(), vec!["S-earlier"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_reconnect_drop_ends_monitor() {
        let connector = ScriptedConnector::new(vec![
            Scripted::Accept {
                responses: vec![
                    telemetry_response("S-1", "P1"),
                    Err(tonic::Status::unavailable("gone")),
                ],
                hold_open: false,
            },
            Scripted::Fail,
            Scripted::Accept {
                responses: vec![],
                hold_open: true,
            },
        ]);

        let result = run_monitor(connector.clone(), MonitorOptions::new("sat-1"), CancellationToken::new()).await;
        assert!(matches!(result, Err(StreamError::RetryBudgetExhausted { attempts: 1, .. })));
        assert_eq!(connector.handshake_ids(), vec!["", "S-1"]);
    }
}
