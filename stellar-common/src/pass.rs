//! Contact windows ("passes") as issued by the scheduling service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::Plan;
use crate::types::{from_timestamp, to_timestamp};

/// Reasons a plan received from the service cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassError {
    #[error("plan {plan_id}: missing {field} time")]
    MissingTimestamp { plan_id: String, field: &'static str },

    #[error("plan {plan_id}: {field} time is out of range")]
    InvalidTimestamp { plan_id: String, field: &'static str },

    #[error("plan {plan_id}: times out of order (start {start}, aos {aos}, los {los}, end {end})")]
    OutOfOrder {
        plan_id: String,
        start: DateTime<Utc>,
        aos: DateTime<Utc>,
        los: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// A scheduled contact window.
///
/// Always satisfies `start <= aos <= los <= end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass {
    pub id: String,
    pub satellite_id: String,
    pub start: DateTime<Utc>,
    pub aos: DateTime<Utc>,
    pub los: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub downlink_frequency_hz: u64,
}

impl Pass {
    /// Build a pass, checking the ordering of its times.
    pub fn new(
        id: impl Into<String>,
        satellite_id: impl Into<String>,
        start: DateTime<Utc>,
        aos: DateTime<Utc>,
        los: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, PassError> {
        let id = id.into();
        if !(start <= aos && aos <= los && los <= end) {
            return Err(PassError::OutOfOrder {
                plan_id: id,
                start,
                aos,
                los,
                end,
            });
        }

        Ok(Self {
            id,
            satellite_id: satellite_id.into(),
            start,
            aos,
            los,
            end,
            downlink_frequency_hz: 0,
        })
    }

    pub fn with_downlink_frequency(mut self, hz: u64) -> Self {
        self.downlink_frequency_hz = hz;
        self
    }

    /// True while `now` lies inside `[start, end)`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn to_proto(&self) -> Plan {
        Plan {
            plan_id: self.id.clone(),
            satellite_id: self.satellite_id.clone(),
            start_time: Some(to_timestamp(self.start)),
            end_time: Some(to_timestamp(self.end)),
            aos_time: Some(to_timestamp(self.aos)),
            los_time: Some(to_timestamp(self.los)),
            downlink_center_frequency_hz: self.downlink_frequency_hz,
        }
    }
}

fn field_time(
    plan_id: &str,
    field: &'static str,
    ts: Option<&prost_types::Timestamp>,
) -> Result<DateTime<Utc>, PassError> {
    let ts = ts.ok_or_else(|| PassError::MissingTimestamp {
        plan_id: plan_id.to_string(),
        field,
    })?;
    from_timestamp(ts).ok_or_else(|| PassError::InvalidTimestamp {
        plan_id: plan_id.to_string(),
        field,
    })
}

impl TryFrom<&Plan> for Pass {
    type Error = PassError;

    fn try_from(plan: &Plan) -> Result<Self, Self::Error> {
        let id = plan.plan_id.as_str();
        let start = field_time(id, "start", plan.start_time.as_ref())?;
        let aos = field_time(id, "aos", plan.aos_time.as_ref())?;
        let los = field_time(id, "los", plan.los_time.as_ref())?;
        let end = field_time(id, "end", plan.end_time.as_ref())?;

        Ok(Pass::new(id, plan.satellite_id.clone(), start, aos, los, end)?
            .with_downlink_frequency(plan.downlink_center_frequency_hz))
    }
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Plan ID: {}, Start: {}, AOS: {}, LOS: {}, End: {} (UTC)",
            self.id,
            self.start.format("%H:%M:%S"),
            self.aos.format("%H:%M:%S"),
            self.los.format("%H:%M:%S"),
            self.end.format("%H:%M:%S"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn sample_pass() -> Pass {
        let t = base();
        Pass::new(
            "P1",
            "sat-5",
            t + Duration::seconds(10),
            t + Duration::seconds(15),
            t + Duration::seconds(45),
            t + Duration::seconds(50),
        )
        .unwrap()
    }

    #[test]
    fn test_pass_from_plan() {
        let pass = sample_pass().with_downlink_frequency(437_500_000);
        let plan = pass.to_proto();
        let parsed = Pass::try_from(&plan).unwrap();
        assert_eq!(parsed, pass);
    }

    #[test]
    fn test_missing_timestamp_is_rejected() {
        let mut plan = sample_pass().to_proto();
        plan.los_time = None;

        let err = Pass::try_from(&plan).unwrap_err();
        assert_eq!(
            err,
            PassError::MissingTimestamp {
                plan_id: "P1".to_string(),
                field: "los"
            }
        );
    }

    #[test]
    fn test_out_of_order_times_are_rejected() {
        let t = base();
        let err = Pass::new(
            "bad",
            "sat-5",
            t,
            t + Duration::seconds(30),
            t + Duration::seconds(20),
            t + Duration::seconds(60),
        )
        .unwrap_err();
        assert!(matches!(err, PassError::OutOfOrder { .. }));
    }

    #[test]
    fn test_is_active_at() {
        let pass = sample_pass();
        assert!(!pass.is_active_at(base()));
        assert!(pass.is_active_at(pass.start));
        assert!(pass.is_active_at(pass.end - Duration::milliseconds(1)));
        assert!(!pass.is_active_at(pass.end));
    }

    #[test]
    fn test_display_summary() {
        let summary = sample_pass().to_string();
        assert!(summary.starts_with("Plan ID: P1, Start: "));
        assert!(summary.contains("AOS: "));
    }
}
