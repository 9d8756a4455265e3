//! Deterministic pass schedule.
//!
//! Pass `k` starts at `k * pass_every_minutes` after the Unix epoch, so the
//! same window always yields the same plan ids.

use chrono::{DateTime, Duration, Utc};

use stellar_common::proto::Plan;
use stellar_common::Pass;

use crate::config::ScheduleConfig;

/// Plans for `ground_station_id` whose AOS falls inside `[aos_after, aos_before)`.
pub fn plans_between(
    config: &ScheduleConfig,
    ground_station_id: &str,
    aos_after: DateTime<Utc>,
    aos_before: DateTime<Utc>,
) -> Vec<Plan> {
    let period = (config.pass_every_minutes.max(1) * 60) as i64;
    let margin = config.margin_secs as i64;
    let duration = config.pass_duration_secs as i64;

    let mut plans = Vec::new();
    let mut k = (aos_after.timestamp() - margin).div_euclid(period);
    loop {
        let Some(start) = DateTime::<Utc>::from_timestamp(k * period, 0) else {
            break;
        };
        let aos = start + Duration::seconds(margin);
        if aos >= aos_before {
            break;
        }
        if aos >= aos_after {
            let end = start + Duration::seconds(duration);
            let los = (end - Duration::seconds(margin)).max(aos);
            let id = format!("{}-{}", ground_station_id, k);
            if let Ok(pass) = Pass::new(id, config.satellite_id.clone(), start, aos, los, end) {
                plans.push(pass.with_downlink_frequency(config.downlink_frequency_hz).to_proto());
            }
        }
        k += 1;
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_window_selects_by_aos() {
        let config = ScheduleConfig::default();
        // Passes start every 900s; AOS is 10s later.
        let plans = plans_between(&config, "gs", at(9000), at(9000 + 3600));
        let ids: Vec<_> = plans.iter().map(|p| p.plan_id.as_str()).collect();
        assert_eq!(ids, vec!["gs-10", "gs-11", "gs-12", "gs-13"]);

        let first = Pass::try_from(&plans[0]).unwrap();
        assert_eq!(first.start, at(9000));
        assert_eq!(first.aos, at(9010));
        assert_eq!(first.los, at(9590));
        assert_eq!(first.end, at(9600));
        assert_eq!(first.satellite_id, "sat-1");
        assert_eq!(plans[0].downlink_center_frequency_hz, 437_500_000);
    }

    #[test]
    fn test_aos_after_excludes_earlier_pass() {
        let config = ScheduleConfig::default();
        let plans = plans_between(&config, "gs", at(9011), at(9911));
        let ids: Vec<_> = plans.iter().map(|p| p.plan_id.as_str()).collect();
        assert_eq!(ids, vec!["gs-11"]);
    }

    #[test]
    fn test_same_window_same_ids() {
        let config = ScheduleConfig::default();
        let a = plans_between(&config, "gs", at(100_000), at(107_200));
        let b = plans_between(&config, "gs", at(100_000), at(107_200));
        assert_eq!(a, b);
        assert!(plans_between(&config, "gs", at(100_000), at(100_000)).is_empty());
    }
}
