//! Start/stop coordination for a single long-running task.
//!
//! A [`Lifecycle`] runs at most one [`LifecycleTask`] at a time. Starting
//! while a run is active stops the old run and waits for its `on_stop` to
//! finish before the new `on_start` is invoked.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Something a [`Lifecycle`] can run.
///
/// `on_start` is called synchronously from [`Lifecycle::start`]; it should
/// spawn whatever long-running work it needs and tie it to `cancel`.
/// `on_stop` is called exactly once, after `cancel` fires.
pub trait LifecycleTask: Send + Sync + 'static {
    fn on_start(&self, cancel: CancellationToken);
    fn on_stop(&self);
}

/// Adapter turning a pair of closures into a [`LifecycleTask`].
pub struct FnTask<S, T> {
    start: S,
    stop: T,
}

impl<S, T> FnTask<S, T>
where
    S: Fn(CancellationToken) + Send + Sync + 'static,
    T: Fn() + Send + Sync + 'static,
{
    pub fn new(start: S, stop: T) -> Self {
        Self { start, stop }
    }
}

impl<S, T> LifecycleTask for FnTask<S, T>
where
    S: Fn(CancellationToken) + Send + Sync + 'static,
    T: Fn() + Send + Sync + 'static,
{
    fn on_start(&self, cancel: CancellationToken) {
        (self.start)(cancel)
    }

    fn on_stop(&self) {
        (self.stop)()
    }
}

struct Run {
    cancel: CancellationToken,
    /// Fires once `on_stop` has returned.
    stopped: CancellationToken,
}

#[derive(Default)]
struct State {
    running: bool,
    /// The current run, or the most recent one after it was stopped.
    last: Option<Run>,
}

/// Tracks whether a task is running and serializes its runs.
#[derive(Default)]
pub struct Lifecycle {
    state: Mutex<State>,
    start_gate: tokio::sync::Mutex<()>,
}

impl Lifecycle {
    /// An idle lifecycle. Nothing runs until [`start`](Self::start).
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True between `start` and the next `stop`. Turns false as soon as
    /// `stop` is called, before `on_stop` has finished.
    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Start `task`, first stopping and waiting out any current run.
    pub async fn start<T: LifecycleTask>(&self, task: T) {
        let _gate = self.start_gate.lock().await;

        self.stop();
        self.wait().await;

        let task = Arc::new(task);
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        {
            let mut state = self.lock_state();
            state.running = true;
            state.last = Some(Run {
                cancel: cancel.clone(),
                stopped: stopped.clone(),
            });
        }

        let watcher = task.clone();
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            // Resolve waiters even if on_stop panics.
            let _done = stopped.drop_guard();
            watcher.on_stop();
        });

        task.on_start(cancel);
    }

    /// Signal the current run to stop. No-op when idle.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(run) = &state.last {
            run.cancel.cancel();
        }
    }

    /// Resolve once the current or most recent run has fully stopped,
    /// including its `on_stop`. Returns immediately if nothing is pending.
    pub async fn wait(&self) {
        let stopped = {
            let state = self.lock_state();
            match &state.last {
                Some(run) => run.stopped.clone(),
                None => return,
            }
        };
        stopped.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        stop_delay: Duration,
    }

    impl LifecycleTask for Recorder {
        fn on_start(&self, _cancel: CancellationToken) {
            self.log.lock().unwrap().push(format!("start {}", self.name));
        }

        fn on_stop(&self) {
            std::thread::sleep(self.stop_delay);
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_waits_for_previous_stop() {
        let log: Log = Arc::default();
        let lifecycle = Lifecycle::new();

        lifecycle
            .start(Recorder {
                name: "first",
                log: log.clone(),
                stop_delay: Duration::from_millis(100),
            })
            .await;
        lifecycle
            .start(Recorder {
                name: "second",
                log: log.clone(),
                stop_delay: Duration::ZERO,
            })
            .await;

        assert!(lifecycle.is_running());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start first", "stop first", "start second"]
        );

        lifecycle.stop();
        lifecycle.wait().await;
        assert_eq!(log.lock().unwrap().last().unwrap(), "stop second");
    }

    #[tokio::test]
    async fn test_double_stop_runs_on_stop_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let lifecycle = Lifecycle::new();

        lifecycle
            .start(FnTask::new(
                |_cancel| {},
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ))
            .await;

        lifecycle.stop();
        lifecycle.stop();
        lifecycle.wait().await;
        lifecycle.stop();
        lifecycle.wait().await;

        assert!(!lifecycle.is_running());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_when_never_started_returns() {
        let lifecycle = Lifecycle::new();
        tokio::time::timeout(Duration::from_secs(1), lifecycle.wait())
            .await
            .expect("wait should return immediately");
    }

    #[tokio::test]
    async fn test_start_token_cancelled_by_stop() {
        let lifecycle = Lifecycle::new();
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
        let slot = seen.clone();

        lifecycle
            .start(FnTask::new(
                move |cancel| {
                    *slot.lock().unwrap() = Some(cancel);
                },
                || {},
            ))
            .await;

        let token = seen.lock().unwrap().clone().unwrap();
        assert!(!token.is_cancelled());

        lifecycle.stop();
        assert!(token.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stop_and_wait() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let lifecycle = Arc::new(Lifecycle::new());

        lifecycle
            .start(FnTask::new(
                |_cancel| {},
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ))
            .await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                lifecycle.stop();
                lifecycle.wait().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
