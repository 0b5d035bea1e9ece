//! End-to-end scenarios exercised against the public API only (spec.md §8
//! scenarios 5 and 6, plus the idle-timeout and `finished()` identity
//! checks described alongside them). Integration tests live in their own
//! crate, so the test doubles here are built from the same public traits
//! an embedding application would implement — `EventLoop`, `Transport`,
//! `ConsumerFactory`'s blanket closure impl, `ProtocolConsumer` — rather
//! than the crate's internal `#[cfg(test)]` doubles.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use relay_core::{
    common::payload, CoreError, Connection, ConsumerContext, EventLoop, Producer, ProtocolConsumer, Transport,
};

/// Runs every scheduled task inline, in the order it was handed them.
/// `call_later` ignores the delay entirely — tests that need to assert
/// something did *not* yet happen on a real clock instead call
/// `fire_idle_timers` to trigger them explicitly.
#[derive(Default)]
struct TestLoop {
    timers: RefCell<Vec<Rc<RefCell<Option<Box<dyn FnOnce()>>>>>>,
}

struct TestTimer {
    slot: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl relay_core::TimerHandle for TestTimer {
    fn cancel(&self) {
        self.slot.borrow_mut().take();
    }
}

impl EventLoop for TestLoop {
    fn call_soon(&self, task: Box<dyn FnOnce()>) {
        task();
    }

    fn call_later(&self, _delay: Duration, task: Box<dyn FnOnce()>) -> Box<dyn relay_core::TimerHandle> {
        let slot = Rc::new(RefCell::new(Some(task)));
        self.timers.borrow_mut().push(Rc::clone(&slot));
        Box::new(TestTimer { slot })
    }
}

impl TestLoop {
    fn new() -> Rc<Self> {
        Rc::new(TestLoop::default())
    }

    /// Fire every still-armed timer, oldest first — simulates "T seconds
    /// elapsed with no further activity" for the idle-timeout scenario.
    fn fire_idle_timers(&self) {
        let pending: Vec<_> = self.timers.borrow_mut().drain(..).collect();
        for slot in pending {
            if let Some(task) = slot.borrow_mut().take() {
                task();
            }
        }
    }
}

/// A transport double that records `close` and loops back into
/// `connection_lost`, the way a real transport driver eventually would.
struct RecordingTransport {
    connection: Weak<Connection>,
    closed: Cell<bool>,
}

impl RecordingTransport {
    fn new(connection: &Rc<Connection>) -> Rc<Self> {
        Rc::new(RecordingTransport {
            connection: Rc::downgrade(connection),
            closed: Cell::new(false),
        })
    }
}

impl Transport for RecordingTransport {
    fn close(&self, graceful: bool) {
        self.closed.set(true);
        if let Some(connection) = self.connection.upgrade() {
            connection.connection_lost(None);
        }
        let _ = graceful;
    }
}

/// A consumer that always claims every byte handed to it, never finishing
/// a request on its own.
struct Swallower;

impl ProtocolConsumer for Swallower {
    fn data_received(&mut self, _ctx: &ConsumerContext, data: &[u8]) -> relay_core::CoreResult<usize> {
        Ok(data.len())
    }
}

/// A misbehaving consumer that claims to consume only the first byte of
/// whatever it is given, leaving the rest as leftover — scenario 6.
struct OffByOne;

impl ProtocolConsumer for OffByOne {
    fn data_received(&mut self, _ctx: &ConsumerContext, data: &[u8]) -> relay_core::CoreResult<usize> {
        Ok(if data.is_empty() { 0 } else { 1 })
    }
}

/// A well-behaved consumer that consumes exactly one byte and calls
/// `ctx.finish()` from inside `data_received` before returning — the
/// sequence spec §4.7 step 2 actually mandates for a consumer that leaves
/// leftover bytes ("any consumer that returns leftover data must have
/// already detached").
struct FinishesImmediately;

impl ProtocolConsumer for FinishesImmediately {
    fn data_received(&mut self, ctx: &ConsumerContext, data: &[u8]) -> relay_core::CoreResult<usize> {
        ctx.finish(payload(())).unwrap();
        Ok(if data.is_empty() { 0 } else { 1 })
    }
}

#[test]
fn producer_cap_rejects_the_second_connection() {
    let event_loop: Rc<dyn EventLoop> = TestLoop::new();
    let producer = Producer::new(Rc::clone(&event_loop)).with_max_connections(1);

    let first = producer.new_connection("127.0.0.1:1", Rc::new(|| Box::new(Swallower) as Box<dyn ProtocolConsumer>));
    assert!(first.is_ok());
    assert_eq!(producer.received(), 1);

    let second = producer.new_connection("127.0.0.1:2", Rc::new(|| Box::new(Swallower) as Box<dyn ProtocolConsumer>));
    match second {
        Err(CoreError::TooManyConnections { received, max }) => {
            assert_eq!(received, 2);
            assert_eq!(max, 1);
        }
        _ => panic!("expected the second connection to be rejected"),
    }
}

#[test]
fn consumer_leftover_bytes_while_current_is_a_protocol_error() {
    let event_loop: Rc<dyn EventLoop> = TestLoop::new();
    let producer = Producer::new(Rc::clone(&event_loop));
    let connection = producer
        .new_connection("127.0.0.1:1", Rc::new(|| Box::new(OffByOne) as Box<dyn ProtocolConsumer>))
        .unwrap();
    let transport = RecordingTransport::new(&connection);
    connection.connection_made(transport);

    let err = connection.data_received(b"ab").unwrap_err();
    match err {
        CoreError::ProtocolError { leftover } => assert_eq!(leftover, 1),
        other => panic!("expected ProtocolError, got {other:?}"),
    }
}

#[test]
fn idle_timeout_closes_the_transport_and_fires_connection_lost() {
    let test_loop = TestLoop::new();
    let event_loop: Rc<dyn EventLoop> = Rc::clone(&test_loop);
    let producer = Producer::new(event_loop).with_idle_timeout(Duration::from_millis(1));
    let connection = producer
        .new_connection("127.0.0.1:1", Rc::new(|| Box::new(Swallower) as Box<dyn ProtocolConsumer>))
        .unwrap();
    let transport = RecordingTransport::new(&connection);
    connection.connection_made(Rc::clone(&transport));

    let lost = Rc::new(Cell::new(false));
    let lost_cb = Rc::clone(&lost);
    connection
        .events()
        .bind_one_shot(relay_core::ConnectionOneShotEvent::ConnectionLost, move |_| lost_cb.set(true));

    test_loop.fire_idle_timers();

    assert!(transport.closed.get());
    assert!(lost.get());
    assert_eq!(producer.concurrent_connections(), 0);
}

#[test]
fn consumer_finishing_mid_data_received_does_not_panic() {
    // A consumer that calls `ctx.finish()` from inside `data_received` and
    // then reports leftover bytes must not trip a `RefCell` double-borrow:
    // `finished()` reenters `Connection` while `data_received` is still on
    // the stack, and a fresh consumer must be installed for the rest of
    // the buffer (spec §4.7 step 2, §8 scenario 6).
    let event_loop: Rc<dyn EventLoop> = TestLoop::new();
    let producer = Producer::new(Rc::clone(&event_loop));
    let connection = producer
        .new_connection(
            "127.0.0.1:1",
            Rc::new(|| Box::new(FinishesImmediately) as Box<dyn ProtocolConsumer>),
        )
        .unwrap();
    let transport = RecordingTransport::new(&connection);
    connection.connection_made(transport);

    connection.data_received(b"abc").unwrap();
    assert_eq!(connection.processed(), 3);
}

#[test]
fn finished_rejects_a_mismatched_context() {
    let event_loop: Rc<dyn EventLoop> = TestLoop::new();
    let producer = Producer::new(Rc::clone(&event_loop));
    let connection = producer
        .new_connection("127.0.0.1:1", Rc::new(|| Box::new(Swallower) as Box<dyn ProtocolConsumer>))
        .unwrap();
    let transport = RecordingTransport::new(&connection);
    connection.connection_made(transport);
    connection.data_received(b"x").unwrap();

    let stray = Rc::new(ConsumerContext::new());
    let err = connection.finished(&stray, payload(())).unwrap_err();
    assert!(matches!(err, CoreError::ConsumerMismatch));
}
