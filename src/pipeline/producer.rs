//! [`Producer`] — a connection factory and registry: enforces a
//! max-concurrency cap and propagates a template of repeatable event
//! listeners onto every connection it creates (spec §3, §4.8).
//!
//! Grounded on `original_source/pulsar/async/protocols.py::Producer`.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::common::ThreadAffinity;
use crate::error::{CoreError, CoreResult};
use crate::event::{EventRegistry, NoOneShotEvents};
use crate::pipeline::connection::{Connection, ConnectionManyEvent, ConnectionOneShotEvent, ConsumerFactory};
use crate::runtime::EventLoop;

/// Builds a fresh [`Connection`] on demand — the Rust rendition of the
/// "connection factory" attribute spec §3 lists on `Producer`. A blanket
/// impl over `Connection::new` itself covers the common case; implement
/// this directly only to swap in a `Connection` subtype/wrapper.
pub trait ConnectionFactory {
    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        address: String,
        session_id: u64,
        idle_timeout: Duration,
        consumer_factory: Rc<dyn ConsumerFactory>,
        producer: Weak<Producer>,
        event_loop: Rc<dyn EventLoop>,
    ) -> Rc<Connection>;
}

/// The default [`ConnectionFactory`]: a plain [`Connection::new`].
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(
        &self,
        address: String,
        session_id: u64,
        idle_timeout: Duration,
        consumer_factory: Rc<dyn ConsumerFactory>,
        producer: Weak<Producer>,
        event_loop: Rc<dyn EventLoop>,
    ) -> Rc<Connection> {
        Connection::new(address, session_id, idle_timeout, consumer_factory, Some(producer), event_loop)
    }
}

/// A connection factory and registry (spec §3, §4.8). Exclusively owns
/// its concurrent-connection set; mutations happen only via the
/// `connection_made`/`connection_lost` events each connection it creates
/// fires back to it.
pub struct Producer {
    connection_factory: Rc<dyn ConnectionFactory>,
    received: Cell<u64>,
    max_connections: Cell<u64>,
    idle_timeout_default: Cell<Duration>,
    connections: std::cell::RefCell<HashMap<u64, Weak<Connection>>>,
    /// Repeatable listeners copied onto every connection's registry on
    /// creation (spec §4.8 step 4). `Producer` declares no one-shot events
    /// of its own, hence [`NoOneShotEvents`].
    template_events: EventRegistry<NoOneShotEvents, ConnectionManyEvent>,
    event_loop: Rc<dyn EventLoop>,
    affinity: ThreadAffinity,
}

impl Producer {
    pub fn new(event_loop: Rc<dyn EventLoop>) -> Rc<Self> {
        Producer::with_connection_factory(Rc::new(DefaultConnectionFactory), event_loop)
    }

    pub fn with_connection_factory(connection_factory: Rc<dyn ConnectionFactory>, event_loop: Rc<dyn EventLoop>) -> Rc<Self> {
        Rc::new(Producer {
            connection_factory,
            received: Cell::new(0),
            max_connections: Cell::new(0),
            idle_timeout_default: Cell::new(Duration::from_secs(30)),
            connections: std::cell::RefCell::new(HashMap::new()),
            template_events: EventRegistry::new(),
            event_loop,
            affinity: ThreadAffinity::current(),
        })
    }

    /// Builder-style cap setter. `0` (the default) means unlimited.
    pub fn with_max_connections(self: Rc<Self>, max_connections: u64) -> Rc<Self> {
        self.max_connections.set(max_connections);
        self
    }

    pub fn with_idle_timeout(self: Rc<Self>, timeout: Duration) -> Rc<Self> {
        self.idle_timeout_default.set(timeout);
        self
    }

    pub fn received(&self) -> u64 {
        self.received.get()
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections.get()
    }

    pub fn concurrent_connections(&self) -> u64 {
        self.connections.borrow().len() as u64
    }

    /// Register a listener that should fire for `name` on every
    /// connection this producer creates, present and future (spec §4.8
    /// step 4's "propagate repeatable event listeners").
    pub fn bind_connection_event(&self, name: ConnectionManyEvent, cb: impl Fn(crate::common::EventPayload) + 'static) {
        self.template_events.bind_many(name, cb);
    }

    /// Create a new, not-yet-connected [`Connection`] (spec §4.8).
    /// Fails with [`CoreError::TooManyConnections`] once `received` would
    /// reach a nonzero `max_connections`.
    pub fn new_connection(
        self: &Rc<Self>,
        address: impl Into<String>,
        consumer_factory: Rc<dyn ConsumerFactory>,
    ) -> CoreResult<Rc<Connection>> {
        self.affinity.assert_on_owner_thread();
        let max_connections = self.max_connections.get();
        if max_connections > 0 && self.received.get() >= max_connections {
            return Err(CoreError::TooManyConnections {
                received: self.received.get() + 1,
                max: max_connections,
            });
        }
        self.received.set(self.received.get() + 1);
        let session_id = self.received.get();

        let connection = self.connection_factory.create(
            address.into(),
            session_id,
            self.idle_timeout_default.get(),
            consumer_factory,
            Rc::downgrade(self),
            Rc::clone(&self.event_loop),
        );

        connection.events().copy_many_times_events(&self.template_events, None);

        let producer_for_made = Rc::downgrade(self);
        let connection_weak = Rc::downgrade(&connection);
        connection.events().bind_one_shot(ConnectionOneShotEvent::ConnectionMade, move |_| {
            if let Some(producer) = producer_for_made.upgrade() {
                producer.add_connection(session_id, connection_weak.clone());
            }
        });

        let producer_for_lost = Rc::downgrade(self);
        connection.events().bind_one_shot(ConnectionOneShotEvent::ConnectionLost, move |_| {
            if let Some(producer) = producer_for_lost.upgrade() {
                producer.remove_connection(session_id);
            }
        });

        Ok(connection)
    }

    fn add_connection(&self, session_id: u64, connection: Weak<Connection>) {
        self.connections.borrow_mut().insert(session_id, connection);
    }

    fn remove_connection(&self, session_id: u64) {
        self.connections.borrow_mut().remove(&session_id);
    }

    /// Close one connection, or every currently tracked connection if
    /// `conn` is `None` (spec §4.8).
    pub fn close_connections(&self, conn: Option<&Rc<Connection>>, graceful: bool) {
        match conn {
            Some(connection) => connection.close(graceful),
            None => {
                for weak in self.connections.borrow().values() {
                    if let Some(connection) = weak.upgrade() {
                        connection.close(graceful);
                    }
                }
            }
        }
    }
}
