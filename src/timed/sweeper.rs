//! Periodic sweeper
//!
//! One sweeper drives one `ExpiryStore` on its own cadence. Each tick collects
//! the due records, runs the handler for each under a time bound and applies
//! the outcome to the store. Ticks never overlap: a timer fire that lands
//! while the previous tick is still running is skipped, not queued.

use super::{
    ExpiryStore, HandlerRegistry, SweepError, SweepOutcome, SweepResult, TimedRecord,
};
use crate::SWEEP_TARGET;
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Requests understood by a running sweeper task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepRequest {
    /// Run a tick now instead of waiting for the timer
    SweepNow,
    /// Finish the in-flight tick and stop
    Shutdown,
}

/// Summary of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The previous tick was still running, nothing was evaluated
    pub skipped: bool,
    /// Handlers invoked
    pub fired: usize,
    /// Records deleted
    pub consumed: usize,
    /// Records moved to a new due time
    pub rescheduled: usize,
    /// Records left in place for the next tick
    pub retried: usize,
    /// Handler errors, timeouts and store failures
    pub failed: usize,
}

/// Counters shared by all clones of a sweeper
#[derive(Debug, Default)]
pub struct SweepStats {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
}

impl SweepStats {
    pub fn ticks_run(&self) -> u64 {
        self.ticks_run.load(Ordering::SeqCst)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::SeqCst)
    }
}

/// Drives one store on a fixed cadence
#[derive(Clone)]
pub struct Sweeper {
    name: Arc<str>,
    store: ExpiryStore,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    cadence: Duration,
    handler_timeout: Duration,
    in_flight: Arc<AtomicBool>,
    stats: Arc<SweepStats>,
}

impl Sweeper {
    /// Create a sweeper
    ///
    /// # Errors
    /// Returns `SweepError::InvalidCadence` for a zero cadence or timeout
    pub fn new(
        name: &str,
        store: ExpiryStore,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        cadence: Duration,
        handler_timeout: Duration,
    ) -> SweepResult<Self> {
        if cadence.is_zero() {
            return Err(SweepError::InvalidCadence(format!("{name}: cadence must be non-zero")));
        }
        if handler_timeout.is_zero() {
            return Err(SweepError::InvalidCadence(format!(
                "{name}: handler timeout must be non-zero"
            )));
        }

        Ok(Self {
            name: name.into(),
            store,
            handlers: Arc::new(handlers),
            clock,
            cadence,
            handler_timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SweepStats::default()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn store(&self) -> &ExpiryStore {
        &self.store
    }

    #[must_use]
    pub fn stats(&self) -> &SweepStats {
        &self.stats
    }

    #[must_use]
    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Evaluate every record due at `now`
    ///
    /// Returns a skipped report if another tick of this sweeper is running.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stats.ticks_skipped.fetch_add(1, Ordering::SeqCst);
            debug!(target: SWEEP_TARGET, sweeper = %self.name, "Tick skipped, previous tick still running");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        }

        let _running = InFlight(&self.in_flight);
        self.stats.ticks_run.fetch_add(1, Ordering::SeqCst);
        let report = self.run_tick(now).await;

        if report.fired > 0 {
            info!(
                target: SWEEP_TARGET,
                sweeper = %self.name,
                fired = report.fired,
                consumed = report.consumed,
                rescheduled = report.rescheduled,
                retried = report.retried,
                failed = report.failed,
                "Sweep tick finished"
            );
        }
        report
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut due = self.store.due_before(now);
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));

        for record in due {
            report.fired += 1;
            let outcome = match self.fire(&record).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    report.failed += 1;
                    self.log_failure(&record, &e);
                    SweepOutcome::Retry
                }
            };
            self.apply(&record, outcome, &mut report).await;
        }

        report
    }

    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        match tokio::time::timeout(self.handler_timeout, self.handlers.fire(record)).await {
            Ok(result) => result,
            Err(_) => Err(SweepError::HandlerTimeout {
                id: record.id.clone(),
                kind: record.kind,
            }),
        }
    }

    async fn apply(&self, record: &TimedRecord, outcome: SweepOutcome, report: &mut TickReport) {
        // Consumed recurring records move to their next occurrence
        let outcome = match (outcome, record.next_occurrence()) {
            (SweepOutcome::Consumed, Some(next)) => SweepOutcome::Reschedule(next),
            (outcome, _) => outcome,
        };

        let applied = match outcome {
            SweepOutcome::Consumed => self.store.remove(&record.id).await.map(|_| {
                report.consumed += 1;
            }),
            SweepOutcome::Reschedule(next) => {
                self.store.reschedule(&record.id, next).await.map(|_| {
                    report.rescheduled += 1;
                })
            }
            SweepOutcome::Retry => {
                report.retried += 1;
                Ok(())
            }
        };

        if let Err(e) = applied {
            report.failed += 1;
            error!(
                target: SWEEP_TARGET,
                sweeper = %self.name,
                record_id = %record.id,
                kind = %record.kind,
                error = %e,
                "Failed to update fired record, it will fire again"
            );
        }
    }

    fn log_failure(&self, record: &TimedRecord, e: &SweepError) {
        match e {
            SweepError::HandlerTimeout { .. } => warn!(
                target: SWEEP_TARGET,
                sweeper = %self.name,
                record_id = %record.id,
                kind = %record.kind,
                timeout_ms = u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
                "Handler timed out, record kept for retry"
            ),
            _ => error!(
                target: SWEEP_TARGET,
                sweeper = %self.name,
                record_id = %record.id,
                kind = %record.kind,
                error = %e,
                "Handler failed, record kept for retry"
            ),
        }
    }

    /// Spawn the periodic task
    #[must_use]
    pub fn start(self) -> SweeperHandle {
        let (tx, rx) = mpsc::channel::<SweepRequest>(16);
        let name = self.name.clone();
        let stats = self.stats.clone();
        let task = tokio::spawn(async move {
            self.sweep_task(rx).await;
        });

        SweeperHandle {
            name,
            tx,
            task,
            stats,
        }
    }

    async fn sweep_task(self, mut rx: Receiver<SweepRequest>) {
        info!(
            target: SWEEP_TARGET,
            sweeper = %self.name,
            "Starting sweeper with {}s interval",
            self.cadence.as_secs_f64()
        );

        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<TickReport>> = None;

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SweepRequest::SweepNow) => self.spawn_tick(&mut in_flight),
                    Some(SweepRequest::Shutdown) | None => break,
                },
                _ = interval.tick() => self.spawn_tick(&mut in_flight),
            }
        }

        if let Some(task) = in_flight.take() {
            if let Err(e) = task.await {
                error!(target: SWEEP_TARGET, sweeper = %self.name, error = %e, "In-flight tick aborted");
            }
        }
        info!(target: SWEEP_TARGET, sweeper = %self.name, "Sweeper shut down");
    }

    fn spawn_tick(&self, in_flight: &mut Option<JoinHandle<TickReport>>) {
        if in_flight.as_ref().is_some_and(|task| !task.is_finished()) {
            self.stats.ticks_skipped.fetch_add(1, Ordering::SeqCst);
            debug!(target: SWEEP_TARGET, sweeper = %self.name, "Timer fired during running tick, skipped");
            return;
        }

        let sweeper = self.clone();
        *in_flight = Some(tokio::spawn(async move {
            let now = sweeper.clock.now();
            sweeper.tick(now).await
        }));
    }
}

/// Clears the in-flight flag even if the tick future is dropped midway
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Control handle for a running sweeper
pub struct SweeperHandle {
    name: Arc<str>,
    tx: Sender<SweepRequest>,
    task: JoinHandle<()>,
    stats: Arc<SweepStats>,
}

impl SweeperHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &SweepStats {
        &self.stats
    }

    /// Ask for an immediate tick
    ///
    /// # Errors
    /// Returns an error if the sweeper task has already stopped
    pub async fn sweep_now(&self) -> SweepResult<()> {
        self.tx
            .send(SweepRequest::SweepNow)
            .await
            .map_err(|e| SweepError::Handler(format!("sweeper {} is not running: {e}", self.name)))
    }

    /// Stop the timer, let the in-flight tick finish, and wait for the task
    pub async fn shutdown(self) {
        if self.tx.send(SweepRequest::Shutdown).await.is_err() {
            debug!(target: SWEEP_TARGET, sweeper = %self.name, "Sweeper already stopped");
        }
        if let Err(e) = self.task.await {
            error!(target: SWEEP_TARGET, sweeper = %self.name, error = %e, "Sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::timed::{MemoryBackend, RecordKind, SweepHandler};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        outcome: SweepOutcome,
        delay: Option<Duration>,
        fail: bool,
    }

    impl CountingHandler {
        fn new(outcome: SweepOutcome) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                outcome,
                delay: None,
                fail: false,
            }
        }

        fn delayed(outcome: SweepOutcome, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(outcome)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SweepHandler for CountingHandler {
        async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(record.id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(SweepError::Handler("channel deleted".to_string()));
            }
            Ok(self.outcome)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap()
    }

    fn sweeper_with(
        store: ExpiryStore,
        kind: RecordKind,
        handler: Arc<CountingHandler>,
        clock: ManualClock,
    ) -> Sweeper {
        Sweeper::new(
            "test",
            store,
            HandlerRegistry::new().with(kind, handler),
            Arc::new(clock),
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn record_at(kind: RecordKind, at: DateTime<Utc>) -> TimedRecord {
        TimedRecord::new(kind, at, json!({"guild_id": 1, "user_id": 2}))
    }

    #[tokio::test]
    async fn test_temp_ban_end_to_end() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("temp_bans");
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler.clone(), clock.clone());

        let first = store
            .add(record_at(RecordKind::TempBan, t0() + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        for secs in [100, 200] {
            store
                .add(record_at(RecordKind::TempBan, t0() + chrono::Duration::seconds(secs)))
                .await
                .unwrap();
        }

        clock.advance(chrono::Duration::seconds(2));
        let report = sweeper.tick(clock.now()).await;
        assert_eq!(report.fired, 1);
        assert_eq!(report.consumed, 1);
        assert_eq!(handler.calls(), 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec![first.clone()]);
        assert_eq!(store.len(), 2);
        assert!(store.get(&first).is_none());

        // Same instant again: nothing refires
        let report = sweeper.tick(clock.now()).await;
        assert_eq!(report.fired, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_consumed_record_never_refires_later() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("reminders");
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = sweeper_with(store.clone(), RecordKind::Reminder, handler.clone(), clock);

        store.add(record_at(RecordKind::Reminder, t0())).await.unwrap();
        sweeper.tick(t0()).await;
        sweeper.tick(t0() + chrono::Duration::days(1)).await;

        assert_eq!(handler.calls(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_recurrence_anchored_on_due_time() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("reminders");
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = sweeper_with(store.clone(), RecordKind::Reminder, handler.clone(), clock);

        let id = store
            .add(record_at(RecordKind::Reminder, t0()).recurring(3600))
            .await
            .unwrap();

        let report = sweeper.tick(t0() + chrono::Duration::seconds(5)).await;
        assert_eq!(report.rescheduled, 1);

        let next = store.get(&id).unwrap().due_at;
        assert_eq!(next, t0() + chrono::Duration::seconds(3600));
        assert_ne!(next, t0() + chrono::Duration::seconds(3605));

        // Not due again until the next occurrence
        assert_eq!(sweeper.tick(t0() + chrono::Duration::seconds(3599)).await.fired, 0);
        assert_eq!(sweeper.tick(t0() + chrono::Duration::seconds(3600)).await.fired, 1);
        assert_eq!(store.get(&id).unwrap().due_at, t0() + chrono::Duration::seconds(7200));
    }

    #[tokio::test]
    async fn test_explicit_reschedule_and_retry() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("giveaways");
        let later = t0() + chrono::Duration::minutes(10);
        let rescheduler = Arc::new(CountingHandler::new(SweepOutcome::Reschedule(later)));
        let retrier = Arc::new(CountingHandler::new(SweepOutcome::Retry));

        let sweeper = Sweeper::new(
            "mixed",
            store.clone(),
            HandlerRegistry::new()
                .with(RecordKind::GiveawayEnd, rescheduler.clone())
                .with(RecordKind::EventReminder, retrier.clone()),
            Arc::new(clock),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .unwrap();

        let moved = store.add(record_at(RecordKind::GiveawayEnd, t0())).await.unwrap();
        let kept = store.add(record_at(RecordKind::EventReminder, t0())).await.unwrap();

        let report = sweeper.tick(t0()).await;
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(store.get(&moved).unwrap().due_at, later);
        assert_eq!(store.get(&kept).unwrap().due_at, t0());

        // The retried one fires again next tick
        sweeper.tick(t0()).await;
        assert_eq!(retrier.calls(), 2);
        assert_eq!(rescheduler.calls(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_record() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("reminders");
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..CountingHandler::new(SweepOutcome::Consumed)
        });
        let sweeper = sweeper_with(store.clone(), RecordKind::Reminder, handler, clock);

        let id = store.add(record_at(RecordKind::Reminder, t0())).await.unwrap();
        let report = sweeper.tick(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);
        assert!(store.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_missing_handler_keeps_record() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("temp_bans");
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler, clock);

        let orphan = store.add(record_at(RecordKind::TempMute, t0())).await.unwrap();
        let report = sweeper.tick(t0()).await;
        assert_eq!(report.failed, 1);
        assert!(store.get(&orphan).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_retry() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("temp_bans");
        let handler = Arc::new(CountingHandler::delayed(
            SweepOutcome::Consumed,
            Duration::from_secs(60),
        ));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler, clock);

        let id = store.add(record_at(RecordKind::TempBan, t0())).await.unwrap();
        let report = sweeper.tick(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.consumed, 0);
        assert!(store.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_store_failure_after_fire_keeps_record_for_refire() {
        let clock = ManualClock::new(t0());
        let backend = Arc::new(MemoryBackend::new());
        let store = ExpiryStore::open("temp_bans", backend.clone()).await.unwrap();
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler.clone(), clock);

        let id = store.add(record_at(RecordKind::TempBan, t0())).await.unwrap();
        backend.set_failing(true);
        let report = sweeper.tick(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.consumed, 0);
        assert!(store.get(&id).is_some());

        backend.set_failing(false);
        let report = sweeper.tick(t0()).await;
        assert_eq!(report.consumed, 1);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_direct_tick_is_skipped() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("temp_bans");
        let handler = Arc::new(CountingHandler::delayed(
            SweepOutcome::Consumed,
            Duration::from_secs(5),
        ));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler.clone(), clock);
        store.add(record_at(RecordKind::TempBan, t0())).await.unwrap();

        let (a, b) = tokio::join!(sweeper.tick(t0()), sweeper.tick(t0()));
        assert!(!a.skipped);
        assert!(b.skipped);
        assert_eq!(handler.calls(), 1);
        assert_eq!(sweeper.stats().ticks_run(), 1);
        assert_eq!(sweeper.stats().ticks_skipped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_skipped_while_handler_runs() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("temp_bans");
        let handler = Arc::new(CountingHandler::delayed(
            SweepOutcome::Consumed,
            Duration::from_secs(5),
        ));
        let sweeper = sweeper_with(store.clone(), RecordKind::TempBan, handler.clone(), clock);
        store.add(record_at(RecordKind::TempBan, t0())).await.unwrap();

        let handle = sweeper.start();
        // Timer fires at 0s, 1s, 2s, 3s, 4s; only the first runs
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(handle.stats().ticks_run(), 1);
        assert!(handle.stats().ticks_skipped() >= 3);
        assert_eq!(handler.calls(), 1);

        // Shutdown waits for the in-flight tick to finish
        handle.shutdown().await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_now_and_shutdown() {
        let clock = ManualClock::new(t0());
        let store = ExpiryStore::in_memory("reminders");
        let handler = Arc::new(CountingHandler::new(SweepOutcome::Consumed));
        let sweeper = Sweeper::new(
            "slow",
            store.clone(),
            HandlerRegistry::new().with(RecordKind::Reminder, handler.clone()),
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        )
        .unwrap();

        let handle = sweeper.start();
        // Let the immediate first timer tick run on an empty store
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.add(record_at(RecordKind::Reminder, t0())).await.unwrap();
        handle.sweep_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handler.calls(), 1);
        handle.shutdown().await;
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let result = Sweeper::new(
            "bad",
            ExpiryStore::in_memory("x"),
            HandlerRegistry::new(),
            Arc::new(ManualClock::new(t0())),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SweepError::InvalidCadence(_))));
    }
}
