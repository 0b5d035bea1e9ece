//! [`Connection`] — binds a transport to a current [`ProtocolConsumer`],
//! routes incoming bytes through it, fires lifecycle events, and manages
//! an idle timeout (spec §3, §4.7).
//!
//! Grounded on `original_source/pulsar/async/protocols.py::Connection`.
//! State machine `(unbound) -> (bound) -> (made) -> (lost)` from spec §4.7
//! is represented by the combination of `current` (`None` until a
//! consumer is installed) and `transport` (`None` until
//! [`Connection::connection_made`] runs) rather than an explicit enum,
//! since the two fields genuinely vary independently (a consumer can be
//! installed and detached many times across one transport's lifetime).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::common::{payload, payload_owner, EventPayload, ThreadAffinity};
use crate::error::{CoreError, CoreResult};
use crate::event::{EventNameSet, EventRegistry};
use crate::failure::Failure;
use crate::pipeline::consumer::{ConsumerContext, ConsumerOneShotEvent, ProtocolConsumer};
use crate::pipeline::producer::Producer;
use crate::pipeline::transport::Transport;
use crate::runtime::{EventLoop, TimerHandle};

/// `Connection`'s one-shot event name set (spec §4.7, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionOneShotEvent {
    ConnectionMade,
    ConnectionLost,
}

impl EventNameSet for ConnectionOneShotEvent {
    const ALL: &'static [Self] = &[
        ConnectionOneShotEvent::ConnectionMade,
        ConnectionOneShotEvent::ConnectionLost,
    ];
}

/// `Connection`'s repeatable event name set (spec §4.7, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionManyEvent {
    PreRequest,
    DataReceived,
    PostRequest,
}

impl EventNameSet for ConnectionManyEvent {
    const ALL: &'static [Self] = &[
        ConnectionManyEvent::PreRequest,
        ConnectionManyEvent::DataReceived,
        ConnectionManyEvent::PostRequest,
    ];
}

/// Builds a fresh [`ProtocolConsumer`] on demand — the Rust rendition of
/// the "consumer factory" attribute spec §3 lists on `Connection`.
pub trait ConsumerFactory {
    fn create(&self) -> Box<dyn ProtocolConsumer>;
}

impl<F> ConsumerFactory for F
where
    F: Fn() -> Box<dyn ProtocolConsumer>,
{
    fn create(&self) -> Box<dyn ProtocolConsumer> {
        (self)()
    }
}

struct ActiveConsumer {
    consumer: Rc<RefCell<Box<dyn ProtocolConsumer>>>,
    ctx: Rc<ConsumerContext>,
}

/// Binds a transport to a current [`ProtocolConsumer`] (spec §3, §4.7).
/// Exclusively owns the current consumer and the idle-timer handle;
/// references the transport and producer but does not own them.
pub struct Connection {
    remote_address: String,
    session_id: u64,
    idle_timeout: Duration,
    timer: RefCell<Option<Box<dyn TimerHandle>>>,
    consumer_factory: RefCell<Rc<dyn ConsumerFactory>>,
    current: RefCell<Option<ActiveConsumer>>,
    processed: Cell<u64>,
    producer: RefCell<Option<Weak<Producer>>>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    events: EventRegistry<ConnectionOneShotEvent, ConnectionManyEvent>,
    event_loop: Rc<dyn EventLoop>,
    affinity: ThreadAffinity,
}

impl Connection {
    pub fn new(
        remote_address: impl Into<String>,
        session_id: u64,
        idle_timeout: Duration,
        consumer_factory: Rc<dyn ConsumerFactory>,
        producer: Option<Weak<Producer>>,
        event_loop: Rc<dyn EventLoop>,
    ) -> Rc<Self> {
        Rc::new(Connection {
            remote_address: remote_address.into(),
            session_id,
            idle_timeout,
            timer: RefCell::new(None),
            consumer_factory: RefCell::new(consumer_factory),
            current: RefCell::new(None),
            processed: Cell::new(0),
            producer: RefCell::new(producer),
            transport: RefCell::new(None),
            events: EventRegistry::new(),
            event_loop,
            affinity: ThreadAffinity::current(),
        })
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    pub fn has_current_consumer(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// The producer that created this connection, if any — a non-owning
    /// back-reference (spec §3: "references transport and producer but
    /// does not own them").
    pub fn producer(&self) -> Option<Rc<Producer>> {
        self.producer.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn events(&self) -> &EventRegistry<ConnectionOneShotEvent, ConnectionManyEvent> {
        &self.events
    }

    /// Atomically replace the consumer factory mid-stream (spec §4.7,
    /// used e.g. for a WebSocket upgrade). Does not affect the currently
    /// installed consumer, only the one built the next time
    /// `data_received` needs one.
    pub fn upgrade(&self, factory: Rc<dyn ConsumerFactory>) {
        self.affinity.assert_on_owner_thread();
        *self.consumer_factory.borrow_mut() = factory;
    }

    /// Called by the transport exactly once, before any `data_received`.
    /// Stores the transport, fires the `connection_made` one-shot event,
    /// and arms the idle timer (spec §4.7).
    pub fn connection_made(self: &Rc<Self>, transport: Rc<dyn Transport>) {
        self.affinity.assert_on_owner_thread();
        *self.transport.borrow_mut() = Some(transport);
        let _ = self
            .events
            .fire_one_shot_with_owner(ConnectionOneShotEvent::ConnectionMade, Rc::clone(self));
        self.arm_idle_timer();
    }

    /// Called by the transport exactly once, terminally. Cancels the idle
    /// timer, fires `connection_lost`, and if a current consumer exists,
    /// delegates to its `on_connection_lost` (spec §4.7).
    pub fn connection_lost(self: &Rc<Self>, err: Option<Failure>) {
        self.affinity.assert_on_owner_thread();
        self.cancel_idle_timer();
        let payload_err = payload(err.clone());
        let _ = self.events.fire_one_shot(ConnectionOneShotEvent::ConnectionLost, payload_err);
        let active = self
            .current
            .borrow()
            .as_ref()
            .map(|active| (Rc::clone(&active.consumer), Rc::clone(&active.ctx)));
        if let Some((consumer, ctx)) = active {
            consumer.borrow_mut().on_connection_lost(&ctx, err.as_ref());
        }
    }

    /// Route `data` through the current consumer, creating one via the
    /// factory if none is installed, looping over any leftover bytes the
    /// consumer leaves once it detaches mid-buffer (spec §4.7 step 2).
    pub fn data_received(self: &Rc<Self>, mut data: &[u8]) -> CoreResult<()> {
        self.affinity.assert_on_owner_thread();
        self.cancel_idle_timer();

        while !data.is_empty() {
            if self.current.borrow().is_none() {
                self.install_consumer();
            }

            // Clone the context and consumer handles out, then drop the
            // borrow of `self.current` before calling into the consumer:
            // a consumer is allowed to call `ctx.finish()` from inside
            // `data_received` (spec §4.7 step 2 / §8 scenario 6), which
            // reenters `Connection::finished` and takes `self.current` —
            // holding a live borrow across that call would panic with a
            // `RefCell` double-borrow on a perfectly valid sequence.
            let (ctx, consumer) = {
                let current = self.current.borrow();
                let active = current.as_ref().expect("just installed");
                (Rc::clone(&active.ctx), Rc::clone(&active.consumer))
            };

            let consumed = consumer.borrow_mut().data_received(&ctx, data)?;
            ctx.note_data_received();
            self.events
                .fire_many(ConnectionManyEvent::DataReceived, payload(data[..consumed].to_vec()));

            data = &data[consumed..];

            if !data.is_empty() && self.current.borrow().is_some() {
                return Err(CoreError::ProtocolError { leftover: data.len() });
            }
        }

        self.arm_idle_timer();
        Ok(())
    }

    fn install_consumer(self: &Rc<Self>) {
        let factory = Rc::clone(&*self.consumer_factory.borrow());
        let consumer = Rc::new(RefCell::new(factory.create()));
        let ctx = Rc::new(ConsumerContext::new());
        ctx.bind(self, &ctx);
        *self.current.borrow_mut() = Some(ActiveConsumer {
            consumer: Rc::clone(&consumer),
            ctx: Rc::clone(&ctx),
        });
        // No borrow of `self.current` is held across this call, for the
        // same reentrancy reason as `data_received`: `start_request` may
        // itself call `ctx.finish()` synchronously.
        consumer.borrow_mut().start_request(&ctx);
        self.events
            .fire_many(ConnectionManyEvent::PreRequest, payload_owner(Rc::clone(self)));
    }

    /// Validate that `ctx` is still the connection's current consumer's
    /// context, fire `post_request`, fire the consumer's `finish` one-shot
    /// event with `result`, then detach it (spec §4.7).
    pub fn finished(self: &Rc<Self>, ctx: &Rc<ConsumerContext>, result: EventPayload) -> CoreResult<()> {
        self.affinity.assert_on_owner_thread();
        {
            let current = self.current.borrow();
            match current.as_ref() {
                Some(active) if Rc::ptr_eq(&active.ctx, ctx) => {}
                _ => return Err(CoreError::ConsumerMismatch),
            }
        }
        self.events
            .fire_many(ConnectionManyEvent::PostRequest, payload_owner(Rc::clone(self)));
        ctx.events().fire_one_shot(ConsumerOneShotEvent::Finish, result)?;
        ctx.note_request_processed();
        self.processed.set(self.processed.get() + 1);
        ctx.detach();
        self.current.borrow_mut().take();
        Ok(())
    }

    fn arm_idle_timer(self: &Rc<Self>) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let weak = Rc::downgrade(self);
        let handle = self.event_loop.call_later(
            self.idle_timeout,
            Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.on_idle_timeout();
                }
            }),
        );
        *self.timer.borrow_mut() = Some(handle);
    }

    fn cancel_idle_timer(&self) {
        if let Some(handle) = self.timer.borrow_mut().take() {
            handle.cancel();
        }
    }

    fn on_idle_timeout(self: &Rc<Self>) {
        self.close(false);
    }

    /// Close the transport. The transport driver is expected to follow up
    /// with exactly one `connection_lost` call (spec §6).
    pub fn close(&self, graceful: bool) {
        if let Some(transport) = self.transport.borrow().clone() {
            transport.close(graceful);
        }
    }
}
