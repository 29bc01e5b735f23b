//! The engine: registries, the timer loop, one delivery loop per worker, and
//! the post / cancel / flush entry points.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Engine::new()?;
//! let ty = engine.register_type("generic_test_type", 16)?;
//! let recorder = Recorder::new();
//! let src = engine.register_worker("generic_src", recorder.clone())?;
//! let dst = engine.register_worker("generic_dst", recorder.clone())?;
//!
//! let event = engine.new_event(&ty);
//! event.with_bytes(|b| b[0] = 7)?;
//! engine.post(&src, &dst, &event, Some(deadline_from_now(2, 0)))?;
//!
//! // Deliver it now instead, with status Flush.
//! engine.cancel(&event)?;
//! ```
//!
//! # Lock ordering
//!
//! Timer queue → event route → worker inbox. Every operation that touches
//! more than one of these takes them in that order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dispatch::{DeliveryStatus, Dispatcher};
use crate::error::{CourierError, Result};
use crate::event::{Event, EventState, Promotion, Route};
use crate::registry::WorkerRegistry;
use crate::sync::lock;
use crate::timer::{TimerEntry, TimerKey, TimerQueue};
use crate::types::{EventType, TypeRegistry};
use crate::worker::{Delivery, Handler, Slot, Worker};

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    types: TypeRegistry,
    workers: WorkerRegistry,
    timer: Arc<TimerQueue>,
    seq: AtomicU64,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    config: EngineConfig,
}

impl EngineInner {
    fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = lock(&self.tasks, "engine tasks");
            if self.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        // Workers close before the timer queue empties, so a post that
        // takes the timer lock afterwards sees its destination closed.
        let abandoned: usize = self.workers.all().iter().map(Worker::close).sum();
        let abandoned_timers = self.timer.abandon_all();
        info!(
            tasks = tasks.len(),
            abandoned,
            abandoned_timers,
            "courier engine stopped"
        );
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle to a running dispatch engine.
///
/// Clones share the same registries and tasks. Dropping the last clone
/// stops every loop, as does [`Engine::shutdown`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine with default configuration on the current tokio
    /// runtime.
    pub fn new() -> Result<Self> {
        EngineBuilder::new().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.inner.workers
    }

    // -------------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------------

    /// Register a raw-bytes event type.
    pub fn register_type(&self, name: &str, payload_size: usize) -> Result<EventType> {
        self.inner.types.register_type(name, payload_size)
    }

    /// Register an event type carrying a `T`.
    pub fn register_typed<T>(&self, name: &str) -> Result<EventType>
    where
        T: Default + Send + Sync + 'static,
    {
        self.inner.types.register_typed::<T>(name)
    }

    pub fn get_or_register_type(&self, name: &str, payload_size: usize) -> Result<EventType> {
        self.inner.types.get_or_register_type(name, payload_size)
    }

    pub fn lookup_type(&self, name: &str) -> Result<EventType> {
        self.inner.types.lookup_type(name)
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Register a worker and start its delivery loop.
    ///
    /// Fails with `AlreadyExists` if the name is taken, and with
    /// `WorkerStopped` once the engine has shut down.
    pub fn register_worker(&self, name: &str, default_handler: impl Handler) -> Result<Worker> {
        if self.inner.is_stopped() {
            return Err(CourierError::WorkerStopped {
                worker: name.to_string(),
            });
        }
        let worker = self.inner.workers.register(name, Arc::new(default_handler))?;
        self.start_worker(&worker)?;
        Ok(worker)
    }

    /// Return the named worker, registering it with `default_handler` if it
    /// does not exist yet.
    ///
    /// A worker created after shutdown comes back closed.
    pub fn get_or_register_worker(&self, name: &str, default_handler: impl Handler) -> Worker {
        let (worker, created) = self
            .inner
            .workers
            .get_or_register(name, || Arc::new(default_handler));
        if created {
            if let Err(e) = self.start_worker(&worker) {
                debug!(worker = %worker, error = %e, "worker not started");
            }
        }
        worker
    }

    pub fn get_worker(&self, name: &str) -> Result<Worker> {
        self.inner.workers.get(name)
    }

    fn start_worker(&self, worker: &Worker) -> Result<()> {
        let mut tasks = lock(&self.inner.tasks, "engine tasks");
        // Checked under the task lock so a concurrent shutdown either sees
        // this loop or this worker sees the shutdown.
        if self.inner.is_stopped() {
            drop(tasks);
            worker.close();
            return Err(worker_stopped(worker));
        }
        let task = self
            .inner
            .runtime
            .spawn(Dispatcher::new(worker.clone()).run());
        tasks.push(task);
        drop(tasks);
        info!(worker = %worker, id = %worker.id(), "worker registered");
        Ok(())
    }

    /// Install a handler for events of `event_type` delivered to `worker`,
    /// replacing any previous one. Takes effect for the next delivery.
    pub fn set_handler(&self, worker: &Worker, event_type: &EventType, handler: impl Handler) {
        worker.set_handler(event_type, Arc::new(handler));
        debug!(worker = %worker, event_type = %event_type, "handler installed");
    }

    /// Remove a type-specific handler. Returns false if none was installed.
    pub fn clear_handler(&self, worker: &Worker, event_type: &EventType) -> bool {
        let removed = worker.clear_handler(event_type);
        debug!(worker = %worker, event_type = %event_type, removed, "handler cleared");
        removed
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Allocate an idle event with a fresh payload.
    pub fn new_event(&self, event_type: &EventType) -> Event {
        Event::new(event_type)
    }

    /// Post `event` from `src` to `dst`.
    ///
    /// Without a deadline, or with one at or before now, the event goes
    /// straight to the tail of `dst`'s inbox and is delivered with
    /// [`DeliveryStatus::Ok`]. A future deadline parks it in the timer
    /// queue until then.
    ///
    /// Fails with `Busy` if the event is not idle, and with
    /// `WorkerStopped` if `dst` belongs to an engine that has shut down. A
    /// failed post changes nothing, so of several threads racing to post
    /// the same event exactly one succeeds and the recorded route is the
    /// winner's.
    pub fn post(
        &self,
        src: &Worker,
        dst: &Worker,
        event: &Event,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        match deadline.filter(|d| *d > now) {
            None => self.post_now(src, dst, event, seq),
            Some(deadline) => self.post_at(src, dst, event, seq, deadline, now),
        }
    }

    fn post_now(&self, src: &Worker, dst: &Worker, event: &Event, seq: u64) -> Result<()> {
        let mut route = event.route();
        event
            .transition(EventState::Idle, EventState::Queued)
            .map_err(|state| busy(event, state))?;
        let previous = route.replace(Route {
            src: src.clone(),
            dst: dst.clone(),
            deadline: None,
            seq,
        });
        let accepted = dst.push(Slot::Deliver(Delivery {
            event: event.clone(),
            src: src.clone(),
            status: DeliveryStatus::Ok,
            seq,
        }));
        if !accepted {
            *route = previous;
            drop(route);
            event.abandon();
            return Err(worker_stopped(dst));
        }
        drop(route);
        debug!(source = %src, worker = %dst, event = %event.id(), seq, "posted");
        Ok(())
    }

    fn post_at(
        &self,
        src: &Worker,
        dst: &Worker,
        event: &Event,
        seq: u64,
        deadline: Instant,
        now: Instant,
    ) -> Result<()> {
        let mut entries = self.inner.timer.lock();
        // Shutdown closes workers before emptying the queue, so under the
        // timer lock this check cannot be outrun.
        if dst.is_closed() {
            return Err(worker_stopped(dst));
        }
        let mut route = event.route();
        event
            .transition(EventState::Idle, EventState::TimerPending)
            .map_err(|state| busy(event, state))?;
        *route = Some(Route {
            src: src.clone(),
            dst: dst.clone(),
            deadline: Some(deadline),
            seq,
        });
        drop(route);
        let earliest = TimerQueue::insert(
            &mut entries,
            TimerKey { deadline, seq },
            TimerEntry {
                event: event.clone(),
                dst: dst.clone(),
            },
        );
        drop(entries);
        if earliest {
            self.inner.timer.wake();
        }
        debug!(
            source = %src,
            worker = %dst,
            event = %event.id(),
            seq,
            due_in_us = deadline.duration_since(now).as_micros() as u64,
            "posted with deadline"
        );
        Ok(())
    }

    /// Deliver a timer-pending event now, with [`DeliveryStatus::Flush`].
    ///
    /// The event joins the tail of its destination's inbox. Fails with
    /// `NotPending` unless the event is waiting for its deadline, and with
    /// `WorkerStopped` if the destination stopped meanwhile, in which case
    /// the event is idle again.
    pub fn cancel(&self, event: &Event) -> Result<()> {
        let mut entries = self.inner.timer.lock();
        // Leaving TimerPending requires the timer lock, so the state read
        // here is stable until we release it.
        let key = {
            let route = event.route();
            let state = event.state();
            match route.as_ref().and_then(Route::timer_key) {
                Some(key) if state == EventState::TimerPending => key,
                _ => return Err(not_pending(event, state)),
            }
        };
        let Some(entry) = entries.remove(&key) else {
            return Err(not_pending(event, event.state()));
        };
        match event.promote(key.seq, DeliveryStatus::Flush) {
            Promotion::Enqueued => {}
            Promotion::Stale => return Err(not_pending(event, event.state())),
            Promotion::Refused => return Err(worker_stopped(&entry.dst)),
        }
        drop(entries);
        debug!(event = %event.id(), seq = key.seq, "cancelled");
        Ok(())
    }

    /// Wait until everything addressed to `worker` at call time has been
    /// delivered.
    ///
    /// Everything that would otherwise have waited is forced and delivered
    /// with [`DeliveryStatus::Flush`]: events still queued in the inbox
    /// keep their FIFO position, and timer-pending events for `worker` are
    /// pulled out of the timer queue and delivered right after them,
    /// earliest deadline first. An event already being handled when the
    /// flush starts keeps its status. Posts made after the call are not
    /// waited for and are unaffected.
    ///
    /// Must not be awaited from a handler running on `worker` itself.
    pub async fn flush(&self, worker: &Worker) -> Result<()> {
        self.begin_flush(worker)
            .await
            .map_err(|_| worker_stopped(worker))
    }

    /// Blocking form of [`flush`](Engine::flush) for threads outside the
    /// runtime. Panics if called from within an async context.
    pub fn flush_blocking(&self, worker: &Worker) -> Result<()> {
        self.begin_flush(worker)
            .blocking_recv()
            .map_err(|_| worker_stopped(worker))
    }

    fn begin_flush(&self, worker: &Worker) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let mut entries = self.inner.timer.lock();
        let forced: SmallVec<[Delivery; 8]> = TimerQueue::take_for(&mut entries, worker)
            .into_iter()
            .filter_map(|(key, event)| event.take_pending(key.seq, DeliveryStatus::Flush))
            .map(|(_, delivery)| delivery)
            .collect();
        let timers = forced.len();
        match worker.force(forced, done) {
            Ok(remarked) => debug!(worker = %worker, timers, remarked, "flush started"),
            Err(refused) => {
                for delivery in refused {
                    delivery.event.abandon();
                }
                debug!(worker = %worker, "flush on a stopped worker");
            }
        }
        drop(entries);
        rx
    }

    /// Number of events waiting in the timer queue.
    pub fn pending_timers(&self) -> usize {
        self.inner.timer.len()
    }

    /// Stop the timer loop and every worker loop. Queued and timer-pending
    /// events go back to idle without being delivered, pending flushes fail
    /// with `WorkerStopped`, and so do later posts and registrations.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("types", &self.inner.types)
            .field("workers", &self.inner.workers)
            .field("pending_timers", &self.pending_timers())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn busy(event: &Event, state: EventState) -> CourierError {
    CourierError::Busy {
        event: event.id(),
        state,
    }
}

fn not_pending(event: &Event, state: EventState) -> CourierError {
    CourierError::NotPending {
        event: event.id(),
        state,
    }
}

fn worker_stopped(worker: &Worker) -> CourierError {
    CourierError::WorkerStopped {
        worker: worker.name().to_string(),
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for an [`Engine`].
///
/// ```ignore
/// let engine = Engine::builder()
///     .with_config(EngineConfig::from_env()?)
///     .with_runtime(runtime.handle().clone())
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn loops on `runtime` instead of the runtime current at
    /// `build()` time.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the engine and start its timer loop.
    ///
    /// Fails with `NoRuntime` if no runtime was given and none is current.
    pub fn build(self) -> Result<Engine> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| CourierError::NoRuntime(e.to_string()))?,
        };
        let timer = Arc::new(TimerQueue::new(self.config.timer_slack));
        let timer_task = runtime.spawn(Arc::clone(&timer).run());
        info!(timer_slack_us = self.config.timer_slack.as_micros() as u64, "courier engine started");

        Ok(Engine {
            inner: Arc::new(EngineInner {
                types: TypeRegistry::new(),
                workers: WorkerRegistry::new(),
                timer,
                seq: AtomicU64::new(0),
                runtime,
                tasks: Mutex::new(vec![timer_task]),
                stopped: AtomicBool::new(false),
                config: self.config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::Recorder;
    use crate::time::{deadline_from_now, time_diff};

    const GUARD: Duration = Duration::from_secs(5);

    struct Fixture {
        engine: Engine,
        ty: EventType,
        src: Worker,
        dst: Worker,
        recorder: Recorder,
    }

    fn fixture() -> Fixture {
        let engine = Engine::new().unwrap();
        let ty = engine.register_type("generic_test_type", 16).unwrap();
        let recorder = Recorder::new();
        let src = engine
            .register_worker("generic_src", recorder.clone())
            .unwrap();
        let dst = engine
            .register_worker("generic_dst", recorder.clone())
            .unwrap();
        Fixture {
            engine,
            ty,
            src,
            dst,
            recorder,
        }
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let err = Engine::new().unwrap_err();
        assert!(matches!(err, CourierError::NoRuntime(_)));
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let engine = Engine::builder()
            .with_runtime(rt.handle().clone())
            .build()
            .unwrap();
        let recorder = Recorder::new();
        let w = engine.register_worker("w", recorder.clone()).unwrap();
        let ty = engine.register_type("t", 0).unwrap();
        let event = engine.new_event(&ty);

        engine.post(&w, &w, &event, None).unwrap();
        engine.flush_blocking(&w).unwrap();
        assert_eq!(recorder.len(), 1);
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_worker_is_rejected() {
        let f = fixture();
        let err = f
            .engine
            .register_worker("generic_src", Recorder::new())
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(f.engine.get_worker("generic_src").unwrap(), f.src);
        assert!(f.engine.get_worker("missing").unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_or_register_worker_starts_loop_once() {
        let f = fixture();
        let again = f.engine.get_or_register_worker("generic_dst", Recorder::new());
        assert_eq!(again, f.dst);

        let fresh_recorder = Recorder::new();
        let fresh = f
            .engine
            .get_or_register_worker("fresh", fresh_recorder.clone());
        let event = f.engine.new_event(&f.ty);
        f.engine.post(&f.src, &fresh, &event, None).unwrap();
        tokio::time::timeout(GUARD, fresh_recorder.wait_for(1))
            .await
            .expect("fresh worker should deliver");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_post_without_deadline_delivers_ok() {
        let f = fixture();
        let event = f.engine.new_event(&f.ty);
        event.with_bytes(|b| b[0] = 42).unwrap();

        f.engine.post(&f.src, &f.dst, &event, None).unwrap();
        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(1))
            .await
            .unwrap();

        assert_eq!(received[0].status, DeliveryStatus::Ok);
        assert_eq!(received[0].source, f.src);
        assert_eq!(received[0].destination, f.dst);
        assert_eq!(received[0].event, event);
        event.idle().await;
        assert_eq!(event.with_bytes(|b| b[0]).unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_past_or_now_deadline_is_immediate() {
        let f = fixture();
        let now_event = f.engine.new_event(&f.ty);
        let past_event = f.engine.new_event(&f.ty);

        f.engine
            .post(&f.src, &f.dst, &now_event, Some(deadline_from_now(0, 0)))
            .unwrap();
        let past = Instant::now()
            .checked_sub(Duration::from_millis(5))
            .unwrap_or_else(Instant::now);
        f.engine
            .post(&f.src, &f.dst, &past_event, Some(past))
            .unwrap();

        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(2))
            .await
            .unwrap();
        assert!(received.iter().all(|r| r.status == DeliveryStatus::Ok));
        assert_eq!(f.engine.pending_timers(), 0);
        assert_eq!(now_event.deadline(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deadline_is_met_and_never_early() {
        let f = fixture();
        let event = f.engine.new_event(&f.ty);
        let deadline = deadline_from_now(0, 200_000_000);

        f.engine
            .post(&f.src, &f.dst, &event, Some(deadline))
            .unwrap();
        assert_eq!(event.state(), EventState::TimerPending);
        assert_eq!(f.engine.pending_timers(), 1);

        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(1))
            .await
            .unwrap();
        let late = time_diff(received[0].at, deadline);
        assert_eq!(received[0].status, DeliveryStatus::Ok);
        assert!(late >= 0.0, "delivered {late}s before the deadline");
        assert!(late < 0.005, "delivered {late}s after the deadline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deadlines_land_within_a_millisecond() {
        const SAMPLES: usize = 20;
        let f = fixture();
        let events: Vec<Event> = (0..SAMPLES).map(|_| f.engine.new_event(&f.ty)).collect();
        let mut deadlines = Vec::with_capacity(SAMPLES);
        for (i, event) in events.iter().enumerate() {
            let deadline = deadline_from_now(0, 20_000_000 + 7_000_000 * i as u32);
            f.engine
                .post(&f.src, &f.dst, event, Some(deadline))
                .unwrap();
            deadlines.push(deadline);
        }

        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(SAMPLES))
            .await
            .unwrap();
        let mut late: Vec<f64> = received
            .iter()
            .zip(&deadlines)
            .map(|(r, deadline)| time_diff(r.at, *deadline))
            .collect();
        assert!(late.iter().all(|l| *l >= 0.0), "early delivery: {late:?}");
        late.sort_by(f64::total_cmp);
        // p90 over twenty samples
        assert!(late[SAMPLES * 9 / 10 - 1] < 0.001, "lateness {late:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repost_while_pending_is_busy() {
        let f = fixture();
        let event = f.engine.new_event(&f.ty);
        f.engine
            .post(&f.src, &f.dst, &event, Some(deadline_from_now(60, 0)))
            .unwrap();

        let err = f.engine.post(&f.dst, &f.src, &event, None).unwrap_err();
        assert!(err.is_busy());
        assert!(matches!(
            err,
            CourierError::Busy {
                state: EventState::TimerPending,
                ..
            }
        ));
        // Nothing about the winning post changed.
        assert_eq!(event.destination(), Some(f.dst.clone()));
        assert_eq!(event.state(), EventState::TimerPending);
        f.engine.cancel(&event).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_then_repost() {
        let f = fixture();
        let event = f.engine.new_event(&f.ty);
        f.engine
            .post(&f.src, &f.dst, &event, Some(deadline_from_now(2, 0)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        f.engine.cancel(&event).unwrap();
        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(1))
            .await
            .unwrap();
        assert_eq!(received[0].status, DeliveryStatus::Flush);
        assert_eq!(f.engine.pending_timers(), 0);

        event.idle().await;
        f.engine.post(&f.src, &f.dst, &event, None).unwrap();
        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(2))
            .await
            .unwrap();
        assert_eq!(received[1].status, DeliveryStatus::Ok);
        assert_eq!(received[1].event, event);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_requires_timer_pending() {
        let f = fixture();
        let event = f.engine.new_event(&f.ty);

        let err = f.engine.cancel(&event).unwrap_err();
        assert!(matches!(
            err,
            CourierError::NotPending {
                state: EventState::Idle,
                ..
            }
        ));

        f.engine.post(&f.src, &f.dst, &event, None).unwrap();
        let err = f.engine.cancel(&event).unwrap_err();
        assert!(matches!(err, CourierError::NotPending { .. }));
        tokio::time::timeout(GUARD, f.recorder.wait_for(1))
            .await
            .unwrap();
        assert_eq!(f.recorder.received()[0].status, DeliveryStatus::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fifo_per_destination() {
        let f = fixture();
        let events: Vec<Event> = (0..3).map(|_| f.engine.new_event(&f.ty)).collect();
        for (i, event) in events.iter().enumerate() {
            let src = if i % 2 == 0 { &f.src } else { &f.dst };
            f.engine.post(src, &f.dst, event, None).unwrap();
        }

        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(3))
            .await
            .unwrap();
        let order: Vec<&Event> = received.iter().map(|r| &r.event).collect();
        assert_eq!(order, events.iter().collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_equal_deadlines_fire_in_post_order() {
        let f = fixture();
        let deadline = deadline_from_now(0, 50_000_000);
        let events: Vec<Event> = (0..4).map(|_| f.engine.new_event(&f.ty)).collect();
        for event in &events {
            f.engine
                .post(&f.src, &f.dst, event, Some(deadline))
                .unwrap();
        }

        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(4))
            .await
            .unwrap();
        let order: Vec<&Event> = received.iter().map(|r| &r.event).collect();
        assert_eq!(order, events.iter().collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_semantics() {
        let f = fixture();
        let n: usize = 7;
        let immediate = n.div_ceil(2);
        let events: Vec<Event> = (0..n).map(|_| f.engine.new_event(&f.ty)).collect();
        for event in &events[..immediate] {
            f.engine.post(&f.src, &f.dst, event, None).unwrap();
        }
        tokio::time::timeout(GUARD, f.recorder.wait_for(immediate))
            .await
            .unwrap();
        for event in &events[immediate..] {
            f.engine
                .post(&f.src, &f.dst, event, Some(deadline_from_now(60, 0)))
                .unwrap();
        }
        assert_eq!(f.engine.pending_timers(), n - immediate);

        tokio::time::timeout(GUARD, f.engine.flush(&f.dst))
            .await
            .expect("flush should complete")
            .unwrap();

        let received = f.recorder.received();
        assert_eq!(received.len(), n);
        assert_eq!(f.engine.pending_timers(), 0);
        for (i, (r, event)) in received.iter().zip(&events).enumerate() {
            assert_eq!(&r.event, event);
            let expected = if i < immediate {
                DeliveryStatus::Ok
            } else {
                DeliveryStatus::Flush
            };
            assert_eq!(r.status, expected, "event {i}");
        }

        // The worker keeps accepting posts with normal semantics.
        let after = f.engine.new_event(&f.ty);
        f.engine.post(&f.src, &f.dst, &after, None).unwrap();
        let received = tokio::time::timeout(GUARD, f.recorder.wait_for(n + 1))
            .await
            .unwrap();
        assert_eq!(received[n].status, DeliveryStatus::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_forces_events_still_queued() {
        let f = fixture();
        // Hold the worker inside a handler so posts pile up in its inbox.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let gated = f.engine.register_type("gated", 0).unwrap();
        f.engine.set_handler(&f.dst, &gated, {
            let gate = gate.clone();
            move |_: &Worker, _: &Worker, _: DeliveryStatus, _: &Event| {
                gate.wait();
            }
        });
        let blocker = f.engine.new_event(&gated);
        f.engine.post(&f.src, &f.dst, &blocker, None).unwrap();
        while blocker.state() != EventState::Delivering {
            tokio::task::yield_now().await;
        }

        let queued = f.engine.new_event(&f.ty);
        let timed = f.engine.new_event(&f.ty);
        f.engine.post(&f.src, &f.dst, &queued, None).unwrap();
        f.engine
            .post(&f.src, &f.dst, &timed, Some(deadline_from_now(60, 0)))
            .unwrap();

        let flush = {
            let engine = f.engine.clone();
            let dst = f.dst.clone();
            tokio::spawn(async move { engine.flush(&dst).await })
        };
        while f.engine.pending_timers() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();

        tokio::time::timeout(GUARD, flush)
            .await
            .expect("flush should complete")
            .unwrap()
            .unwrap();

        let received = f.recorder.received();
        let delivered: Vec<(&Event, DeliveryStatus)> =
            received.iter().map(|r| (&r.event, r.status)).collect();
        assert_eq!(
            delivered,
            vec![(&queued, DeliveryStatus::Flush), (&timed, DeliveryStatus::Flush)]
        );
        assert_eq!(f.dst.stats().delivered_flush, 2);
        assert!(blocker.is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_leaves_other_workers_alone() {
        let f = fixture();
        let other = f.engine.new_event(&f.ty);
        f.engine
            .post(&f.dst, &f.src, &other, Some(deadline_from_now(60, 0)))
            .unwrap();

        tokio::time::timeout(GUARD, f.engine.flush(&f.dst))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.state(), EventState::TimerPending);
        assert_eq!(f.engine.pending_timers(), 1);
        f.engine.cancel(&other).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_type_handler_overrides_default() {
        let f = fixture();
        let special = f.engine.register_type("special", 0).unwrap();
        let override_recorder = Recorder::new();
        f.engine
            .set_handler(&f.dst, &special, override_recorder.clone());

        let event = f.engine.new_event(&special);
        f.engine.post(&f.src, &f.dst, &event, None).unwrap();
        f.engine.flush(&f.dst).await.unwrap();
        assert_eq!(override_recorder.len(), 1);
        assert_eq!(f.recorder.len(), 0);

        assert!(f.engine.clear_handler(&f.dst, &special));
        f.engine.post(&f.src, &f.dst, &event, None).unwrap();
        f.engine.flush(&f.dst).await.unwrap();
        assert_eq!(override_recorder.len(), 1);
        assert_eq!(f.recorder.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_workers() {
        let f = fixture();
        f.engine.shutdown();
        f.engine.shutdown();

        assert!(f.dst.is_closed());
        let err = f.engine.flush(&f.dst).await.unwrap_err();
        assert!(err.is_stopped());

        // A refused post leaves the event exactly as it was.
        let fresh = f.engine.new_event(&f.ty);
        let err = f.engine.post(&f.src, &f.dst, &fresh, None).unwrap_err();
        assert!(err.is_stopped());
        assert!(fresh.is_idle());
        assert_eq!(fresh.destination(), None);
        let err = f
            .engine
            .post(&f.src, &f.dst, &fresh, Some(deadline_from_now(0, 50_000_000)))
            .unwrap_err();
        assert!(err.is_stopped());
        assert_eq!(f.engine.pending_timers(), 0);

        let err = f
            .engine
            .register_worker("late", Recorder::new())
            .unwrap_err();
        assert!(err.is_stopped());
        let late = f.engine.get_or_register_worker("later", Recorder::new());
        assert!(late.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_hands_back_pending_events() {
        let f = fixture();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let gated = f.engine.register_type("gated", 0).unwrap();
        f.engine.set_handler(&f.dst, &gated, {
            let gate = gate.clone();
            move |_: &Worker, _: &Worker, _: DeliveryStatus, _: &Event| {
                gate.wait();
            }
        });
        let blocker = f.engine.new_event(&gated);
        f.engine.post(&f.src, &f.dst, &blocker, None).unwrap();
        while blocker.state() != EventState::Delivering {
            tokio::task::yield_now().await;
        }

        let queued = f.engine.new_event(&f.ty);
        let timed = f.engine.new_event(&f.ty);
        f.engine.post(&f.src, &f.dst, &queued, None).unwrap();
        f.engine
            .post(&f.src, &f.dst, &timed, Some(deadline_from_now(60, 0)))
            .unwrap();
        assert_eq!(queued.state(), EventState::Queued);

        f.engine.shutdown();

        assert!(queued.is_idle());
        assert!(timed.is_idle());
        assert_eq!(f.engine.pending_timers(), 0);
        let err = f.engine.cancel(&timed).unwrap_err();
        assert!(matches!(
            err,
            CourierError::NotPending {
                state: EventState::Idle,
                ..
            }
        ));

        // The handler already running finishes and releases its event.
        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();
        tokio::time::timeout(GUARD, blocker.idle()).await.unwrap();
        assert_eq!(f.recorder.len(), 0);
    }
}
