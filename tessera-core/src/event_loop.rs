//! Debounced scheduling loop with run coalescing.
//!
//! ```text
//!            start()/trigger()             timer fires
//!   Idle ─────────────────────► Scheduled ─────────────► Processing
//!    ▲                             ▲  │ trigger(): restart  │
//!    │ stop()                      │  └─────────────────────┤
//!    │                             │   run done:            │ trigger(): deferred = true
//!    └─────────────────────────────┴── interval, or debounce if deferred
//! ```
//!
//! Every polling or retry path (outbox drain, radar flushes) is driven by
//! one of these. Callback errors are logged and never stop the loop. `stop()`
//! cancels only a pending timer; a run already in progress completes, and a
//! `start()` or `trigger()` issued before it finishes waits for it.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

pub type LoopError = Box<dyn std::error::Error + Send + Sync>;
type Callback = Arc<dyn Fn() -> BoxFuture<'static, Result<(), LoopError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Delay between runs in steady state.
    pub interval: Duration,
    /// Delay after a trigger, and after a run that saw a trigger.
    pub debounce: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            debounce: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Idle,
    Scheduled,
    Processing,
}

struct LoopState {
    status: LoopStatus,
    deferred: bool,
    /// A callback is running, whether or not the loop was stopped since.
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped by `stop()` so a run in flight does not reschedule.
    generation: u64,
    /// Identifies the most recently armed timer; stale timers bail out.
    ticket: u64,
    runs: u64,
}

struct Shared {
    name: String,
    config: EventLoopConfig,
    callback: Callback,
    state: Mutex<LoopState>,
}

/// Cloneable handle; all clones drive the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new<F, Fut>(name: impl Into<String>, config: EventLoopConfig, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LoopError>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move || Box::pin(callback()));
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                callback,
                state: Mutex::new(LoopState {
                    status: LoopStatus::Idle,
                    deferred: false,
                    in_flight: false,
                    timer: None,
                    generation: 0,
                    ticket: 0,
                    runs: 0,
                }),
            }),
        }
    }

    /// Arm the debounce timer if the loop is idle.
    pub fn start(&self) {
        let mut state = self.shared.lock();
        if state.status == LoopStatus::Idle {
            Shared::request(&self.shared, &mut state);
        }
    }

    /// Request a run soon. Bursts while processing collapse into one extra run.
    pub fn trigger(&self) {
        let mut state = self.shared.lock();
        Shared::request(&self.shared, &mut state);
    }

    /// Cancel the pending timer and go idle.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        state.deferred = false;
        state.status = LoopStatus::Idle;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        log::debug!("{} loop stopped", self.shared.name);
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.lock().status
    }

    /// Completed runs so far.
    pub fn runs(&self) -> u64 {
        self.shared.lock().runs
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(shared: &Arc<Shared>, state: &mut LoopState) {
        if state.in_flight {
            state.deferred = true;
        } else {
            Shared::arm(shared, state, shared.config.debounce);
        }
    }

    fn arm(shared: &Arc<Shared>, state: &mut LoopState, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.status = LoopStatus::Scheduled;
        state.ticket += 1;
        let (generation, ticket) = (state.generation, state.ticket);
        let task_shared = Arc::clone(shared);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Shared::run(task_shared, generation, ticket).await;
        }));
    }

    async fn run(shared: Arc<Shared>, generation: u64, ticket: u64) {
        {
            let mut state = shared.lock();
            if state.ticket != ticket
                || state.generation != generation
                || state.status != LoopStatus::Scheduled
            {
                return;
            }
            state.status = LoopStatus::Processing;
            state.in_flight = true;
            // Detach: from here on this task must not be aborted.
            state.timer = None;
        }

        if let Err(e) = (shared.callback)().await {
            log::error!("{} loop callback failed: {e}", shared.name);
        }

        let mut state = shared.lock();
        state.runs += 1;
        state.in_flight = false;
        if state.generation != generation {
            // Stopped mid-run; only a request made since then restarts it.
            if std::mem::take(&mut state.deferred) {
                Shared::arm(&shared, &mut state, shared.config.debounce);
            }
            return;
        }
        let delay = if std::mem::take(&mut state.deferred) {
            shared.config.debounce
        } else {
            shared.config.interval
        };
        Shared::arm(&shared, &mut state, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counting_loop(config: EventLoopConfig, work: Duration) -> (EventLoop, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let event_loop = EventLoop::new("test", config, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(work).await;
                Ok(())
            }
        });
        (event_loop, count)
    }

    fn quiet() -> EventLoopConfig {
        EventLoopConfig {
            interval: Duration::from_secs(3600),
            debounce: ms(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_after_debounce() {
        let (event_loop, count) = counting_loop(quiet(), ms(1));
        event_loop.start();
        assert_eq!(event_loop.status(), LoopStatus::Scheduled);

        sleep(ms(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(ms(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event_loop.status(), LoopStatus::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_run_coalesce_into_one() {
        let (event_loop, count) = counting_loop(quiet(), ms(50));
        event_loop.start();

        sleep(ms(15)).await;
        assert_eq!(event_loop.status(), LoopStatus::Processing);
        for _ in 0..10 {
            event_loop.trigger();
        }

        sleep(ms(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sleep(ms(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(event_loop.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_restarts_debounce() {
        let (event_loop, count) = counting_loop(quiet(), ms(1));
        event_loop.trigger();
        sleep(ms(8)).await;
        event_loop.trigger();
        sleep(ms(8)).await;
        // 16ms elapsed, but the timer was restarted at 8ms
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(ms(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_in_steady_state() {
        let config = EventLoopConfig {
            interval: ms(100),
            debounce: ms(10),
        };
        let (event_loop, count) = counting_loop(config, ms(1));
        event_loop.start();
        sleep(ms(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(ms(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sleep(ms(101)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let (event_loop, count) = counting_loop(quiet(), ms(1));
        event_loop.start();
        event_loop.stop();
        assert_eq!(event_loop.status(), LoopStatus::Idle);
        sleep(ms(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_inflight_run_finish() {
        let (event_loop, count) = counting_loop(quiet(), ms(50));
        event_loop.start();
        sleep(ms(15)).await;
        assert_eq!(event_loop.status(), LoopStatus::Processing);

        event_loop.stop();
        sleep(ms(100)).await;
        assert_eq!(event_loop.runs(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event_loop.status(), LoopStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_stopped_run_never_overlaps() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (gauge, high) = (running.clone(), peak.clone());
        let event_loop = EventLoop::new("overlap", quiet(), move || {
            let (gauge, high) = (gauge.clone(), high.clone());
            async move {
                let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                sleep(ms(50)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        event_loop.start();
        sleep(ms(15)).await;
        assert_eq!(event_loop.status(), LoopStatus::Processing);

        event_loop.stop();
        event_loop.trigger();
        sleep(ms(20)).await;
        // still waiting on the first run
        assert_eq!(event_loop.runs(), 0);

        sleep(ms(200)).await;
        assert_eq!(event_loop.runs(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_error_does_not_halt() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let config = EventLoopConfig {
            interval: ms(20),
            debounce: ms(5),
        };
        let event_loop = EventLoop::new("failing", config, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), LoopError>("boom".into())
            }
        });
        event_loop.start();
        sleep(ms(50)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
