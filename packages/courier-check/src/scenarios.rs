//! The conformance scenarios.
//!
//! Each scenario drives a real engine and records its verdict on the
//! [`Report`]. A scenario that cannot observe the delivery it waits for
//! within [`WAIT`] fails its assertion instead of hanging.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use courier::testing::{Received, Recorder};
use courier::{
    deadline_from_now, time_diff, DeliveryStatus, Engine, EngineConfig, Event, EventType, Worker,
};

use crate::report::Report;

pub const POST_WITHOUT_DEADLINE: u32 = 1;
pub const POST_WITH_CURRENT_DEADLINE: u32 = 2;
pub const POST_WITH_FUTURE_DEADLINE: u32 = 3;
pub const REPOST_POSTED_EVENT: u32 = 4;
pub const CANCEL_POSTED_EVENT: u32 = 5;
pub const RESCHEDULE: u32 = 6;
pub const DELIVERY_ORDER: u32 = 7;
pub const FLUSH_EVENTS: u32 = 8;
pub const POST_ON_FLUSHED_WORKER: u32 = 9;
pub const MULTI_THREAD: u32 = 10;

pub const ASSERTIONS: &[(u32, &str)] = &[
    (POST_WITHOUT_DEADLINE, "Test posting an event without a deadline"),
    (POST_WITH_CURRENT_DEADLINE, "Test posting an event with a current deadline"),
    (POST_WITH_FUTURE_DEADLINE, "Test posting an event with a future deadline"),
    (REPOST_POSTED_EVENT, "Test reposting a posted event"),
    (CANCEL_POSTED_EVENT, "Test cancelling a posted event"),
    (RESCHEDULE, "Test rescheduling a cancelled event"),
    (DELIVERY_ORDER, "Test event delivery order"),
    (FLUSH_EVENTS, "Test flushing events"),
    (POST_ON_FLUSHED_WORKER, "Test posting an event on a flushed worker"),
    (MULTI_THREAD, "Test multiple threads posting the same event"),
];

/// How long a scenario waits for a delivery.
pub const WAIT: Duration = Duration::from_secs(5);

/// Allowed distance between a deadline and its delivery, in seconds.
pub const TIME_DIFF_THRESHOLD: f64 = 0.001;

const GENERIC_WORKER_DST: &str = "generic_dst";
const GENERIC_WORKER_SRC: &str = "generic_src";
const GENERIC_TEST_TYPE: &str = "generic_test_type";
const GENERIC_NO_TEST_TYPE: &str = "generic_no_test_type";
const ORDER_NUM_EVENTS: u32 = 3;
const FLUSH_NUM_EVENTS: usize = 10;

#[derive(Debug, Default, Clone)]
struct DeliveredOrder {
    order: u32,
}

/// What a single delivery is expected to look like.
struct Expected<'a> {
    event: &'a Event,
    event_type: &'a EventType,
    status: DeliveryStatus,
    destination: &'a str,
    deadline: Option<Instant>,
}

impl Expected<'_> {
    /// `Ok(reason)` if `received` matches, `Err(reason)` otherwise.
    fn check(&self, received: &Received) -> Result<String, String> {
        if received.status != self.status {
            return Err(format!(
                "The delivery status '{}' is not '{}'",
                received.status, self.status
            ));
        }
        if received.destination.name() != self.destination {
            return Err(format!(
                "The event was delivered to '{}' instead of '{}'",
                received.destination, self.destination
            ));
        }
        if &received.event != self.event {
            return Err("Wrong event was delivered".to_string());
        }
        if received.event_type != self.event_type.name() {
            return Err(format!(
                "Wrong event type '{}' was delivered, expecting '{}'",
                received.event_type,
                self.event_type.name()
            ));
        }
        if let Some(deadline) = self.deadline {
            let diff = time_diff(received.at, deadline);
            if !(0.0..=TIME_DIFF_THRESHOLD).contains(&diff) {
                return Err(format!(
                    "The event was delivered {diff:.6}s from its deadline"
                ));
            }
        }
        Ok("The expected event was delivered".to_string())
    }
}

struct Fixture {
    engine: Engine,
    src: Worker,
    dst: Worker,
    test_type: EventType,
    no_test_type: EventType,
    recorder: Recorder,
}

impl Fixture {
    fn new(config: EngineConfig) -> Result<Self> {
        let engine = Engine::builder()
            .with_config(config)
            .build()
            .context("Failed to start the engine")?;
        let recorder = Recorder::new();
        let dst = engine.register_worker(GENERIC_WORKER_DST, recorder.clone())?;
        let src = engine.register_worker(GENERIC_WORKER_SRC, recorder.clone())?;
        let test_type = engine.register_type(GENERIC_TEST_TYPE, 64)?;
        let no_test_type = engine.register_type(GENERIC_NO_TEST_TYPE, 64)?;
        // Deliveries of this type are not part of any check.
        engine.set_handler(
            &dst,
            &no_test_type,
            |_: &Worker, _: &Worker, _: DeliveryStatus, _: &Event| {},
        );
        Ok(Self {
            engine,
            src,
            dst,
            test_type,
            no_test_type,
            recorder,
        })
    }

    /// Wait for delivery number `nth` (1-based) on the generic recorder and
    /// check it.
    async fn expect_delivery(&self, nth: usize, expected: Expected<'_>) -> Result<String, String> {
        wait_nth(&self.recorder, nth)
            .await
            .and_then(|received| expected.check(&received))
    }
}

async fn wait_nth(recorder: &Recorder, nth: usize) -> Result<Received, String> {
    match tokio::time::timeout(WAIT, recorder.wait_for(nth)).await {
        Ok(received) => Ok(received[nth - 1].clone()),
        Err(_) => Err(format!("No delivery within {WAIT:?}")),
    }
}

fn record(report: &mut Report, number: u32, verdict: Result<String, String>) -> Result<bool> {
    match verdict {
        Ok(reason) => report.assert_test(number, true, &reason),
        Err(reason) => report.assert_test(number, false, &reason),
    }
}

/// Run every scenario against a fresh engine.
pub async fn run(config: EngineConfig, report: &mut Report) -> Result<()> {
    let fx = Fixture::new(config)?;

    posting(&fx, report).await?;
    cancel_and_reschedule(&fx, report).await?;
    delivery_order(&fx, report).await?;
    flush(&fx, report).await?;
    multiple_threads(&fx, report).await?;

    fx.engine.shutdown();
    Ok(())
}

async fn posting(fx: &Fixture, report: &mut Report) -> Result<()> {
    let event = fx.engine.new_event(&fx.test_type);
    let expected = |deadline| Expected {
        event: &event,
        event_type: &fx.test_type,
        status: DeliveryStatus::Ok,
        destination: GENERIC_WORKER_DST,
        deadline,
    };

    fx.engine.post(&fx.src, &fx.dst, &event, None)?;
    let verdict = fx.expect_delivery(1, expected(None)).await;
    record(report, POST_WITHOUT_DEADLINE, verdict)?;
    event.idle().await;

    let now = deadline_from_now(0, 0);
    fx.engine.post(&fx.src, &fx.dst, &event, Some(now))?;
    let verdict = fx.expect_delivery(2, expected(Some(now))).await;
    record(report, POST_WITH_CURRENT_DEADLINE, verdict)?;
    event.idle().await;

    let future = deadline_from_now(2, 0);
    fx.engine.post(&fx.src, &fx.dst, &event, Some(future))?;
    let verdict = fx.expect_delivery(3, expected(Some(future))).await;
    record(report, POST_WITH_FUTURE_DEADLINE, verdict)?;
    event.idle().await;

    let other = fx.engine.new_event(&fx.no_test_type);
    fx.engine
        .post(&fx.src, &fx.dst, &other, Some(deadline_from_now(2, 0)))?;
    let verdict = match fx.engine.post(&fx.src, &fx.dst, &other, None) {
        Err(e) if e.is_busy() => Ok("post returned Busy for an already posted event".to_string()),
        Err(e) => Err(format!("post returned '{e}' instead of Busy")),
        Ok(()) => Err("post accepted an already posted event".to_string()),
    };
    record(report, REPOST_POSTED_EVENT, verdict)?;
    Ok(())
}

async fn cancel_and_reschedule(fx: &Fixture, report: &mut Report) -> Result<()> {
    let event = fx.engine.new_event(&fx.test_type);
    let expected = |status| Expected {
        event: &event,
        event_type: &fx.test_type,
        status,
        destination: GENERIC_WORKER_DST,
        deadline: None,
    };
    let seen = fx.recorder.len();

    fx.engine
        .post(&fx.src, &fx.dst, &event, Some(deadline_from_now(2, 0)))?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let verdict = match fx.engine.cancel(&event) {
        Ok(()) => fx.expect_delivery(seen + 1, expected(DeliveryStatus::Flush)).await,
        Err(e) => Err(format!("cancel failed: {e}")),
    };
    record(report, CANCEL_POSTED_EVENT, verdict)?;
    event.idle().await;

    fx.engine.post(&fx.src, &fx.dst, &event, None)?;
    let verdict = fx.expect_delivery(seen + 2, expected(DeliveryStatus::Ok)).await;
    record(report, RESCHEDULE, verdict)?;
    event.idle().await;
    Ok(())
}

async fn delivery_order(fx: &Fixture, report: &mut Report) -> Result<()> {
    let order_type = fx.engine.register_typed::<DeliveredOrder>("order_type")?;
    let recorder = Recorder::new();
    fx.engine.set_handler(&fx.dst, &order_type, recorder.clone());

    let events = (0..ORDER_NUM_EVENTS)
        .map(|order| -> Result<Event> {
            let event = fx.engine.new_event(&order_type);
            event.set_data(DeliveredOrder { order })?;
            Ok(event)
        })
        .collect::<Result<Vec<Event>>>()?;
    for event in &events {
        fx.engine.post(&fx.src, &fx.dst, event, None)?;
    }

    let verdict = match tokio::time::timeout(WAIT, recorder.wait_for(events.len())).await {
        Ok(received) => {
            let order = received
                .iter()
                .map(|r| r.event.data::<DeliveredOrder>().map(|d| d.order))
                .collect::<courier::Result<Vec<u32>>>()?;
            if order == (0..ORDER_NUM_EVENTS).collect::<Vec<_>>() {
                Ok("The event delivery order was correct".to_string())
            } else {
                Err(format!("The event delivery order was wrong: {order:?}"))
            }
        }
        Err(_) => Err(format!("No delivery within {WAIT:?}")),
    };
    record(report, DELIVERY_ORDER, verdict)?;
    Ok(())
}

async fn flush(fx: &Fixture, report: &mut Report) -> Result<()> {
    let flush_type = fx.engine.register_type("flush_type", 16)?;
    let recorder = Recorder::new();
    fx.engine.set_handler(&fx.dst, &flush_type, recorder.clone());

    let events: Vec<Event> = (0..FLUSH_NUM_EVENTS)
        .map(|_| fx.engine.new_event(&flush_type))
        .collect();
    let immediate = FLUSH_NUM_EVENTS.div_ceil(2);
    let mut expected = Vec::with_capacity(FLUSH_NUM_EVENTS);
    for event in &events[..immediate] {
        fx.engine.post(&fx.src, &fx.dst, event, None)?;
        expected.push(DeliveryStatus::Ok);
    }
    // The first half is delivered normally before the rest is posted;
    // anything still queued when the flush starts would be forced too.
    if let Err(cond) = wait_nth(&recorder, immediate).await {
        record(report, FLUSH_EVENTS, Err(cond))?;
        return Ok(());
    }
    for event in &events[immediate..] {
        fx.engine
            .post(&fx.src, &fx.dst, event, Some(deadline_from_now(2, 0)))?;
        expected.push(DeliveryStatus::Flush);
    }

    let verdict = match tokio::time::timeout(WAIT, fx.engine.flush(&fx.dst)).await {
        Ok(Ok(())) => {
            let received = recorder.received();
            let delivered: Vec<DeliveryStatus> = received.iter().map(|r| r.status).collect();
            let in_order = received.iter().map(|r| &r.event).eq(events.iter());
            if delivered == expected && in_order {
                Ok(format!("Expected statuses {expected:?} were delivered"))
            } else {
                Err(format!(
                    "Expected statuses {expected:?}, delivered {delivered:?} (in order: {in_order})"
                ))
            }
        }
        Ok(Err(e)) => Err(format!("flush failed: {e}")),
        Err(_) => Err(format!("flush did not return within {WAIT:?}")),
    };
    record(report, FLUSH_EVENTS, verdict)?;

    let first = &events[0];
    first.idle().await;
    fx.engine.post(&fx.src, &fx.dst, first, None)?;
    let verdict = wait_nth(&recorder, FLUSH_NUM_EVENTS + 1)
        .await
        .and_then(|received| {
            Expected {
                event: first,
                event_type: &flush_type,
                status: DeliveryStatus::Ok,
                destination: GENERIC_WORKER_DST,
                deadline: None,
            }
            .check(&received)
        });
    record(report, POST_ON_FLUSHED_WORKER, verdict)?;
    Ok(())
}

async fn multiple_threads(fx: &Fixture, report: &mut Report) -> Result<()> {
    const THREADS: usize = 2;
    let event = fx.engine.new_event(&fx.no_test_type);
    // A far deadline keeps the winner's post pending while the others try.
    let deadline = deadline_from_now(60, 0);

    let outcomes = {
        let (engine, src, dst, event) = (
            fx.engine.clone(),
            fx.src.clone(),
            fx.dst.clone(),
            event.clone(),
        );
        tokio::task::spawn_blocking(move || {
            let start = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let (engine, src, dst, event, start) = (
                        engine.clone(),
                        src.clone(),
                        dst.clone(),
                        event.clone(),
                        start.clone(),
                    );
                    thread::spawn(move || {
                        start.wait();
                        engine.post(&src, &dst, &event, Some(deadline))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow::anyhow!("posting thread panicked")))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .context("posting threads did not complete")??
    };

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_busy()))
        .count();
    let verdict = if winners == 1 && busy == THREADS - 1 {
        Ok("post returned the expected results: one success, the rest Busy".to_string())
    } else {
        Err(format!(
            "{winners} posts succeeded and {busy} returned Busy out of {THREADS}"
        ))
    };
    record(report, MULTI_THREAD, verdict)?;

    if winners == 1 {
        fx.engine.cancel(&event)?;
        event.idle().await;
    }
    Ok(())
}
