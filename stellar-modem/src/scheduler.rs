//! Pass scheduler - discovers upcoming passes and fires start/end events
//!
//! Two periodic activities share one lock-protected pass set:
//! - a poll every `poll_interval` that replaces the set with the service's
//!   view of the next hour (and, with lookback, the previous hour)
//! - a 1 second tick that raises start/end events when "now" crosses a
//!   pass's start or end time
//!
//! Events are dispatched to the [`PassHandler`] on their own tasks, outside
//! the lock, so a slow handler never stalls the tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stellar_common::proto::Plan;
use stellar_common::Pass;

use crate::lifecycle::{Lifecycle, LifecycleTask};

/// Granularity of start/end edge detection.
pub const TICK: Duration = Duration::from_secs(1);

/// Source of the plans scheduled for this ground station.
#[async_trait]
pub trait PassSource: Send + Sync + 'static {
    /// Plans whose AOS falls inside `[aos_after, aos_before)`.
    async fn list_plans(&self, aos_after: DateTime<Utc>, aos_before: DateTime<Utc>) -> anyhow::Result<Vec<Plan>>;
}

/// Receives pass transitions. Calls for different passes may run concurrently.
#[async_trait]
pub trait PassHandler: Send + Sync + 'static {
    async fn on_pass_start(&self, pass: Pass);
    async fn on_pass_end(&self, pass: Pass);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassEvent {
    /// Discovered by a poll while already in progress.
    Resume(Pass),
    /// Start time crossed on a tick.
    Start(Pass),
    /// End time crossed on a tick.
    End(Pass),
    /// Vanished from the schedule while still running.
    Dropped(Pass),
}

impl PassEvent {
    pub fn pass(&self) -> &Pass {
        match self {
            PassEvent::Resume(pass)
            | PassEvent::Start(pass)
            | PassEvent::End(pass)
            | PassEvent::Dropped(pass) => pass,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, PassEvent::Resume(_) | PassEvent::Start(_))
    }
}

#[derive(Debug)]
struct Tracked {
    pass: Pass,
    started: bool,
    ended: bool,
}

/// The pass set, with per-pass flags so each transition fires at most once.
#[derive(Debug)]
pub struct PassTracker {
    passes: Mutex<HashMap<String, Tracked>>,
    lookback: bool,
}

impl PassTracker {
    pub fn new(lookback: bool) -> Self {
        Self {
            passes: Mutex::new(HashMap::new()),
            lookback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.passes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// AOS window to request from the service at `now`.
    pub fn poll_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let hour = chrono::Duration::hours(1);
        let after = if self.lookback { now - hour } else { now };
        (after, now + hour)
    }

    /// Number of passes from the last poll.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when the last poll returned no usable passes.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether the pass with `id` is currently tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Replace the pass set with a fresh poll result.
    ///
    /// Newly discovered passes already in progress are resumed. Passes that
    /// disappear after starting, and before ending, are reported as dropped.
    /// Plans with bad times are skipped.
    pub fn apply_poll(&self, plans: &[Plan], now: DateTime<Utc>) -> Vec<PassEvent> {
        let mut fresh = HashMap::with_capacity(plans.len());
        for plan in plans {
            match Pass::try_from(plan) {
                Ok(pass) => {
                    fresh.insert(pass.id.clone(), pass);
                }
                Err(e) => warn!("Skipping plan with unusable times: {}", e),
            }
        }

        let mut events = Vec::new();
        let mut passes = self.lock();
        let mut next = HashMap::with_capacity(fresh.len());

        for (id, pass) in fresh {
            let tracked = match passes.remove(&id) {
                Some(previous) => Tracked {
                    pass,
                    started: previous.started,
                    ended: previous.ended,
                },
                None => {
                    info!("New pass. {}", pass);
                    let mut tracked = Tracked {
                        pass,
                        started: false,
                        ended: false,
                    };
                    if tracked.pass.is_active_at(now) {
                        info!("Resuming pass. {}", tracked.pass);
                        tracked.started = true;
                        events.push(PassEvent::Resume(tracked.pass.clone()));
                    }
                    tracked
                }
            };
            next.insert(id, tracked);
        }

        for (_, gone) in passes.drain() {
            if gone.started && !gone.ended {
                warn!("Pass dropped from schedule while running. {}", gone.pass);
                events.push(PassEvent::Dropped(gone.pass));
            } else {
                debug!("Pass no longer scheduled. {}", gone.pass);
            }
        }

        *passes = next;
        events
    }

    /// Find passes whose start or end time was crossed within the last tick.
    pub fn check_edges(&self, now: DateTime<Utc>) -> Vec<PassEvent> {
        let tick = chrono::Duration::from_std(TICK).unwrap_or_else(|_| chrono::Duration::seconds(1));
        let zero = chrono::Duration::zero();
        let within = |delta: chrono::Duration| delta >= zero && delta < tick;

        let mut events = Vec::new();
        for tracked in self.lock().values_mut() {
            if !tracked.started && within(now - tracked.pass.start) {
                tracked.started = true;
                events.push(PassEvent::Start(tracked.pass.clone()));
            }
            if !tracked.ended && within(now - tracked.pass.end) {
                tracked.ended = true;
                events.push(PassEvent::End(tracked.pass.clone()));
            }
        }
        events
    }
}

/// Hand events to `handler`, each on its own task.
pub fn dispatch(events: Vec<PassEvent>, handler: &Arc<dyn PassHandler>) {
    for event in events {
        let handler = handler.clone();
        match event {
            PassEvent::Resume(pass) | PassEvent::Start(pass) => {
                info!("Pass start. {}", pass);
                tokio::spawn(async move { handler.on_pass_start(pass).await });
            }
            PassEvent::End(pass) | PassEvent::Dropped(pass) => {
                info!("Pass end. {}", pass);
                tokio::spawn(async move { handler.on_pass_end(pass).await });
            }
        }
    }
}

async fn poll_once(source: &Arc<dyn PassSource>, tracker: &PassTracker, handler: &Arc<dyn PassHandler>) {
    let (aos_after, aos_before) = tracker.poll_window(Utc::now());

    match source.list_plans(aos_after, aos_before).await {
        Ok(plans) => {
            debug!("Received {} plans", plans.len());
            let events = tracker.apply_poll(&plans, Utc::now());
            dispatch(events, handler);
        }
        Err(e) => warn!("Failed to list plans: {:#}", e),
    }
}

struct SchedulerTask {
    source: Arc<dyn PassSource>,
    tracker: Arc<PassTracker>,
    handler: Arc<dyn PassHandler>,
    poll_interval: Duration,
}

impl LifecycleTask for SchedulerTask {
    fn on_start(&self, cancel: CancellationToken) {
        info!("Starting pass scheduler (poll interval: {:?})", self.poll_interval);

        let source = self.source.clone();
        let tracker = self.tracker.clone();
        let handler = self.handler.clone();
        let poll_interval = self.poll_interval;
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            // The first tick completes immediately, giving an initial poll.
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = poll_once(&source, &tracker, &handler) => {}
                }
            }
        });

        let tracker = self.tracker.clone();
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let mut ticker = interval(TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let events = tracker.check_edges(Utc::now());
                        dispatch(events, &handler);
                    }
                }
            }
        });
    }

    fn on_stop(&self) {
        info!("Shutting down pass scheduler");
    }
}

/// Polls for passes and raises start/end transitions while running.
pub struct PassScheduler {
    source: Arc<dyn PassSource>,
    tracker: Arc<PassTracker>,
    lifecycle: Lifecycle,
}

impl PassScheduler {
    pub fn new(source: Arc<dyn PassSource>, lookback: bool) -> Self {
        Self {
            source,
            tracker: Arc::new(PassTracker::new(lookback)),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The pass set this scheduler polls into.
    pub fn tracker(&self) -> &PassTracker {
        &self.tracker
    }

    pub async fn start(&self, poll_interval: Duration, handler: Arc<dyn PassHandler>) {
        self.lifecycle
            .start(SchedulerTask {
                source: self.source.clone(),
                tracker: self.tracker.clone(),
                handler,
                poll_interval,
            })
            .await;
    }

    /// Stop polling and ticking. Handler calls already dispatched keep running.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub async fn wait(&self) {
        self.lifecycle.wait().await;
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn millis(n: i64) -> ChronoDuration {
        ChronoDuration::milliseconds(n)
    }

    fn plan(id: &str, start: i64, aos: i64, los: i64, end: i64) -> Plan {
        let t = t0();
        Pass::new(id, "sat-1", t + secs(start), t + secs(aos), t + secs(los), t + secs(end))
            .unwrap()
            .to_proto()
    }

    fn ids(events: &[PassEvent]) -> Vec<(String, bool)> {
        events
            .iter()
            .map(|e| (e.pass().id.clone(), e.is_start()))
            .collect()
    }

    #[test]
    fn test_upcoming_pass_fires_start_and_end_once() {
        let tracker = PassTracker::new(true);
        let events = tracker.apply_poll(&[plan("P1", 10, 15, 45, 50)], t0());
        assert!(events.is_empty());

        assert!(tracker.check_edges(t0() + secs(9)).is_empty());

        let events = tracker.check_edges(t0() + secs(10) + millis(300));
        assert!(matches!(events.as_slice(), [PassEvent::Start(p)] if p.id == "P1"));
        assert!(tracker.check_edges(t0() + secs(10) + millis(800)).is_empty());

        // A repeat poll of the same set neither resumes nor resets the flags.
        assert!(tracker.apply_poll(&[plan("P1", 10, 15, 45, 50)], t0() + secs(20)).is_empty());
        assert!(tracker.check_edges(t0() + secs(10) + millis(900)).is_empty());

        let events = tracker.check_edges(t0() + secs(50) + millis(100));
        assert!(matches!(events.as_slice(), [PassEvent::End(p)] if p.id == "P1"));
        assert!(tracker.check_edges(t0() + secs(50) + millis(600)).is_empty());
    }

    #[test]
    fn test_pass_in_progress_is_resumed_on_discovery() {
        let tracker = PassTracker::new(true);
        let events = tracker.apply_poll(&[plan("P2", -60, -55, 300, 310)], t0());
        assert!(matches!(events.as_slice(), [PassEvent::Resume(p)] if p.id == "P2"));

        // Already started; the tick never raises a second start.
        assert!(tracker.check_edges(t0() + secs(1)).is_empty());

        let events = tracker.check_edges(t0() + secs(310));
        assert_eq!(ids(&events), vec![("P2".to_string(), false)]);
    }

    #[test]
    fn test_finished_pass_is_not_resumed() {
        let tracker = PassTracker::new(true);
        let events = tracker.apply_poll(&[plan("old", -600, -590, -20, -10)], t0());
        assert!(events.is_empty());
        assert!(tracker.contains("old"));
    }

    #[test]
    fn test_dropped_running_pass_gets_end() {
        let tracker = PassTracker::new(true);
        tracker.apply_poll(
            &[plan("running", -30, -25, 100, 110), plan("later", 600, 605, 700, 710)],
            t0(),
        );

        let events = tracker.apply_poll(&[], t0() + secs(5));
        assert_eq!(ids(&events), vec![("running".to_string(), false)]);
        assert!(matches!(events[0], PassEvent::Dropped(_)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_malformed_plan_is_skipped() {
        let tracker = PassTracker::new(true);
        let mut broken = plan("broken", 10, 15, 45, 50);
        broken.aos_time = None;

        tracker.apply_poll(&[broken, plan("ok", 10, 15, 45, 50)], t0());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains("ok"));
        assert!(!tracker.contains("broken"));
    }

    #[test]
    fn test_poll_window() {
        let (after, before) = PassTracker::new(true).poll_window(t0());
        assert_eq!(after, t0() - ChronoDuration::hours(1));
        assert_eq!(before, t0() + ChronoDuration::hours(1));

        let (after, _) = PassTracker::new(false).poll_window(t0());
        assert_eq!(after, t0());
    }

    struct FixedSource {
        plans: Vec<Plan>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PassSource for FixedSource {
        async fn list_plans(&self, _after: DateTime<Utc>, _before: DateTime<Utc>) -> anyhow::Result<Vec<Plan>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plans.clone())
        }
    }

    struct ChannelHandler(mpsc::UnboundedSender<(String, bool)>);

    #[async_trait]
    impl PassHandler for ChannelHandler {
        async fn on_pass_start(&self, pass: Pass) {
            let _ = self.0.send((pass.id, true));
        }

        async fn on_pass_end(&self, pass: Pass) {
            let _ = self.0.send((pass.id, false));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_polls_and_resumes() {
        let now = Utc::now();
        let active = Pass::new(
            "live",
            "sat-1",
            now - secs(60),
            now - secs(55),
            now + secs(3000),
            now + secs(3010),
        )
        .unwrap();
        let source = Arc::new(FixedSource {
            plans: vec![active.to_proto()],
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let scheduler = PassScheduler::new(source.clone(), true);
        scheduler
            .start(Duration::from_secs(300), Arc::new(ChannelHandler(tx)))
            .await;

        assert_eq!(rx.recv().await.unwrap(), ("live".to_string(), true));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());

        scheduler.stop();
        scheduler.wait().await;
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
