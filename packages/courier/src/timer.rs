//! Deadline-ordered timer queue.
//!
//! One queue per engine holds every `TimerPending` event, keyed by
//! `(deadline, post sequence)` so equal deadlines fire in post order. A
//! single loop task moves due events into their destination inbox with
//! status `Ok`. `cancel` and `flush` remove entries early and enqueue them
//! with status `Flush`.
//!
//! # Accuracy
//!
//! tokio timers round up to the next millisecond tick and the driver can
//! wake a further tick late, so the loop sleeps until `deadline - slack`
//! and then yields until the deadline has actually passed. The slack has to
//! cover both ticks for delivery to land within a millisecond of the
//! deadline. An event is never delivered before its deadline.
//!
//! # Lock ordering
//!
//! Timer queue → event route → worker inbox. The loop holds the queue lock
//! while promoting due events, so a concurrent flush never misses an event
//! that is "between" the queue and the inbox.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::dispatch::DeliveryStatus;
use crate::event::{Event, Promotion};
use crate::sync::lock;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
}

pub(crate) struct TimerEntry {
    pub(crate) event: Event,
    pub(crate) dst: Worker,
}

pub(crate) type Entries = BTreeMap<TimerKey, TimerEntry>;

/// Events pulled out of the queue by a flush, in deadline order.
pub(crate) type Forced = SmallVec<[(TimerKey, Event); 8]>;

pub(crate) struct TimerQueue {
    entries: Mutex<Entries>,
    wake: Notify,
    slack: Duration,
}

impl TimerQueue {
    pub(crate) fn new(slack: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            slack,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Entries> {
        lock(&self.entries, "timer queue")
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Insert under an already-held lock. Returns true if the entry is the
    /// new earliest deadline, in which case the caller must [`wake`] the
    /// loop after releasing the lock.
    ///
    /// [`wake`]: TimerQueue::wake
    pub(crate) fn insert(entries: &mut Entries, key: TimerKey, entry: TimerEntry) -> bool {
        let earliest = entries.first_key_value().map_or(true, |(first, _)| key < *first);
        entries.insert(key, entry);
        earliest
    }

    /// Remove every entry destined for `worker`, earliest first.
    pub(crate) fn take_for(entries: &mut Entries, worker: &Worker) -> Forced {
        let keys: SmallVec<[TimerKey; 8]> = entries
            .iter()
            .filter(|(_, entry)| entry.dst == *worker)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.event)))
            .collect()
    }

    /// Empty the queue, handing every pending event back to its owner.
    /// Returns how many were abandoned.
    pub(crate) fn abandon_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.lock());
        entries
            .into_iter()
            .filter_map(|(key, entry)| entry.event.take_pending(key.seq, DeliveryStatus::Ok))
            .inspect(|(_, delivery)| delivery.event.abandon())
            .count()
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Promote every entry due at `now`. Returns the next deadline, if any.
    pub(crate) fn fire_due(&self, now: Instant) -> Option<Instant> {
        let mut entries = self.lock();
        while let Some(first) = entries.first_entry() {
            if first.key().deadline > now {
                return Some(first.key().deadline);
            }
            let (key, entry) = first.remove_entry();
            match entry.event.promote(key.seq, DeliveryStatus::Ok) {
                Promotion::Enqueued => {
                    trace!(event = %entry.event.id(), worker = %entry.dst, late_us = now.duration_since(key.deadline).as_micros() as u64, "deadline reached");
                }
                Promotion::Stale => trace!(event = %entry.event.id(), "skipping stale timer entry"),
                Promotion::Refused => {
                    debug!(event = %entry.event.id(), worker = %entry.dst, "destination stopped, dropping due event");
                }
            }
        }
        None
    }

    /// Run until the task is aborted.
    pub(crate) async fn run(self: Arc<Self>) {
        debug!(slack_us = self.slack.as_micros() as u64, "timer loop starting");
        loop {
            let Some(deadline) = self.fire_due(Instant::now()) else {
                self.wake.notified().await;
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= self.slack {
                // Close enough that a tokio sleep would overshoot; yield
                // until the deadline passes.
                tokio::task::yield_now().await;
                continue;
            }

            let wake_at = tokio::time::Instant::from_std(deadline - self.slack);
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::{EventState, Route};
    use crate::types::TypeRegistry;
    use crate::worker::{Handler, Slot};

    fn worker(name: &str) -> Worker {
        let noop: Arc<dyn Handler> =
            Arc::new(|_: &Worker, _: &Worker, _: DeliveryStatus, _: &Event| {});
        Worker::new(name, noop)
    }

    /// Put `event` into the pending state the way `Engine::post` does.
    fn schedule(queue: &TimerQueue, event: &Event, dst: &Worker, deadline: Instant, seq: u64) {
        let mut entries = queue.lock();
        event
            .transition(EventState::Idle, EventState::TimerPending)
            .unwrap();
        *event.route() = Some(Route {
            src: dst.clone(),
            dst: dst.clone(),
            deadline: Some(deadline),
            seq,
        });
        TimerQueue::insert(
            &mut entries,
            TimerKey { deadline, seq },
            TimerEntry {
                event: event.clone(),
                dst: dst.clone(),
            },
        );
    }

    fn drain(worker: &Worker) -> Vec<(Event, DeliveryStatus)> {
        let mut out = Vec::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        while worker.stats().queued > 0 {
            match rt.block_on(worker.next()) {
                Slot::Deliver(d) => out.push((d.event, d.status)),
                Slot::Barrier(_) => {}
            }
        }
        out
    }

    #[test]
    fn test_keys_order_by_deadline_then_seq() {
        let now = Instant::now();
        let a = TimerKey { deadline: now, seq: 5 };
        let b = TimerKey { deadline: now, seq: 6 };
        let c = TimerKey {
            deadline: now + Duration::from_millis(1),
            seq: 1,
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_insert_reports_new_earliest() {
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let dst = worker("dst");
        let now = Instant::now();
        let mut entries = Entries::new();

        let entry = |e: &Event| TimerEntry {
            event: e.clone(),
            dst: dst.clone(),
        };
        let (e1, e2, e3) = (Event::new(&ty), Event::new(&ty), Event::new(&ty));
        let later = TimerKey {
            deadline: now + Duration::from_secs(2),
            seq: 1,
        };
        let sooner = TimerKey {
            deadline: now + Duration::from_secs(1),
            seq: 2,
        };
        let latest = TimerKey {
            deadline: now + Duration::from_secs(3),
            seq: 3,
        };
        assert!(TimerQueue::insert(&mut entries, later, entry(&e1)));
        assert!(TimerQueue::insert(&mut entries, sooner, entry(&e2)));
        assert!(!TimerQueue::insert(&mut entries, latest, entry(&e3)));
    }

    #[test]
    fn test_fire_due_promotes_only_due_entries() {
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let queue = TimerQueue::new(Duration::from_millis(1));
        let dst = worker("dst");
        let now = Instant::now();

        let due = Event::new(&ty);
        let later = Event::new(&ty);
        schedule(&queue, &due, &dst, now, 1);
        schedule(&queue, &later, &dst, now + Duration::from_secs(60), 2);

        let next = queue.fire_due(now);
        assert_eq!(next, Some(now + Duration::from_secs(60)));
        assert_eq!(due.state(), EventState::Queued);
        assert_eq!(later.state(), EventState::TimerPending);
        assert_eq!(queue.len(), 1);

        let delivered = drain(&dst);
        assert_eq!(delivered, vec![(due, DeliveryStatus::Ok)]);
    }

    #[test]
    fn test_stale_entry_is_skipped() {
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let queue = TimerQueue::new(Duration::ZERO);
        let dst = worker("dst");
        let now = Instant::now();
        let event = Event::new(&ty);
        schedule(&queue, &event, &dst, now, 1);

        // Re-record the route as if a later post owned the event.
        event.route().as_mut().unwrap().seq = 2;

        assert_eq!(queue.fire_due(now), None);
        assert_eq!(event.state(), EventState::TimerPending);
        assert_eq!(dst.stats().queued, 0);
    }

    #[test]
    fn test_take_for_only_takes_matching_worker() {
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let queue = TimerQueue::new(Duration::ZERO);
        let (a, b) = (worker("a"), worker("b"));
        let now = Instant::now();

        let for_a_late = Event::new(&ty);
        let for_b = Event::new(&ty);
        let for_a_early = Event::new(&ty);
        schedule(&queue, &for_a_late, &a, now + Duration::from_secs(3), 1);
        schedule(&queue, &for_b, &b, now + Duration::from_secs(2), 2);
        schedule(&queue, &for_a_early, &a, now + Duration::from_secs(1), 3);

        let forced = TimerQueue::take_for(&mut queue.lock(), &a);
        let forced: Vec<Event> = forced.into_iter().map(|(_, e)| e).collect();
        assert_eq!(forced, vec![for_a_early, for_a_late]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_never_fires_early() {
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let queue = Arc::new(TimerQueue::new(Duration::from_millis(1)));
        let fired_early = Arc::new(AtomicUsize::new(0));
        let dst = {
            let fired_early = fired_early.clone();
            let handler: Arc<dyn Handler> =
                Arc::new(move |_: &Worker, _: &Worker, _: DeliveryStatus, e: &Event| {
                    if let Some(deadline) = e.deadline() {
                        if Instant::now() < deadline {
                            fired_early.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            Worker::new("dst", handler)
        };
        let timer_task = tokio::spawn(Arc::clone(&queue).run());
        let worker_task = tokio::spawn(crate::dispatch::Dispatcher::new(dst.clone()).run());

        let events: Vec<Event> = (0..5).map(|_| Event::new(&ty)).collect();
        let start = Instant::now();
        for (i, event) in events.iter().enumerate() {
            let deadline = start + Duration::from_millis(20 * (i as u64 + 1));
            schedule(&queue, event, &dst, deadline, i as u64);
            queue.wake();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            for event in &events {
                while event.state() != EventState::Idle {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        })
        .await
        .expect("all timers should fire");

        assert_eq!(fired_early.load(Ordering::SeqCst), 0);
        assert_eq!(dst.stats().delivered_ok, 5);
        timer_task.abort();
        worker_task.abort();
    }
}
