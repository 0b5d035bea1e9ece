//! [`ProtocolConsumer`] — the application-supplied handler a
//! [`Connection`](super::connection::Connection) routes bytes through
//! (spec §3, §6), plus [`ConsumerContext`], the per-instance state spec
//! §3 lists against `ProtocolConsumer` (back-reference, counters, its own
//! `finish`/`data_received` events).
//!
//! Python's `ProtocolConsumer` is a class applications subclass directly,
//! mixing its own fields in with the base's. Rust splits that in two, the
//! way the teacher's [`Context`](crate::pipeline) trait is handed to a
//! `Handler` rather than the handler inheriting from it: `ConsumerContext`
//! owns the state spec §3 names, and the application implements
//! [`ProtocolConsumer`] against a `&ConsumerContext` passed into every
//! call — composition standing in for the inheritance Rust doesn't have.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::common::EventPayload;
use crate::error::CoreResult;
use crate::event::{EventNameSet, EventRegistry};
use crate::failure::Failure;
use crate::pipeline::connection::Connection;

/// `ProtocolConsumer`'s one-shot event name set (spec §6): fires exactly
/// once, when the consumer has finished producing a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerOneShotEvent {
    Finish,
}

impl EventNameSet for ConsumerOneShotEvent {
    const ALL: &'static [Self] = &[ConsumerOneShotEvent::Finish];
}

/// `ProtocolConsumer`'s repeatable event name set (spec §6): fires once
/// per chunk of bytes handed to the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerManyEvent {
    DataReceived,
}

impl EventNameSet for ConsumerManyEvent {
    const ALL: &'static [Self] = &[ConsumerManyEvent::DataReceived];
}

/// The state spec §3 lists against `ProtocolConsumer`: a nullable
/// back-reference to the owning [`Connection`] (cleared on detach), the
/// current request marker, and the three counters (data-received,
/// request-processed, reconnect-retry).
///
/// Owned by exactly one `Connection` at a time; becomes unowned once
/// [`Connection::finished`] fires this context's `finish` one-shot event.
pub struct ConsumerContext {
    connection: RefCell<Option<Weak<Connection>>>,
    self_weak: RefCell<Option<Weak<ConsumerContext>>>,
    current_request: RefCell<Option<EventPayload>>,
    data_received_count: Cell<u64>,
    request_processed_count: Cell<u64>,
    reconnect_retry_count: Cell<u64>,
    events: EventRegistry<ConsumerOneShotEvent, ConsumerManyEvent>,
}

impl Default for ConsumerContext {
    fn default() -> Self {
        ConsumerContext::new()
    }
}

impl ConsumerContext {
    pub fn new() -> Self {
        ConsumerContext {
            connection: RefCell::new(None),
            self_weak: RefCell::new(None),
            current_request: RefCell::new(None),
            data_received_count: Cell::new(0),
            request_processed_count: Cell::new(0),
            reconnect_retry_count: Cell::new(0),
            events: EventRegistry::new(),
        }
    }

    pub fn events(&self) -> &EventRegistry<ConsumerOneShotEvent, ConsumerManyEvent> {
        &self.events
    }

    /// The connection this consumer is currently bound to, if any — `None`
    /// once `finish` has fired and the back-reference was cleared.
    pub fn connection(&self) -> Option<Rc<Connection>> {
        self.connection.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind(&self, connection: &Rc<Connection>, self_rc: &Rc<ConsumerContext>) {
        *self.connection.borrow_mut() = Some(Rc::downgrade(connection));
        *self.self_weak.borrow_mut() = Some(Rc::downgrade(self_rc));
    }

    /// Tell the owning [`Connection`] this consumer has finished producing
    /// a response, firing this context's `Finish` one-shot event with
    /// `result` and detaching the consumer (spec §4.7). The ergonomic
    /// counterpart to [`Connection::finished`](super::connection::Connection::finished),
    /// which needs an `Rc<ConsumerContext>` a `&ConsumerContext` has no way
    /// to produce on its own.
    pub fn finish(&self, result: EventPayload) -> CoreResult<()> {
        let connection = self
            .connection()
            .ok_or(crate::error::CoreError::ConsumerMismatch)?;
        let self_rc = self
            .self_weak
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(crate::error::CoreError::ConsumerMismatch)?;
        connection.finished(&self_rc, result)
    }

    pub(crate) fn detach(&self) {
        self.connection.borrow_mut().take();
        self.self_weak.borrow_mut().take();
    }

    pub fn current_request(&self) -> Option<EventPayload> {
        self.current_request.borrow().clone()
    }

    pub fn set_current_request(&self, request: Option<EventPayload>) {
        *self.current_request.borrow_mut() = request;
    }

    pub fn data_received_count(&self) -> u64 {
        self.data_received_count.get()
    }

    pub fn request_processed_count(&self) -> u64 {
        self.request_processed_count.get()
    }

    pub fn reconnect_retry_count(&self) -> u64 {
        self.reconnect_retry_count.get()
    }

    pub(crate) fn note_data_received(&self) {
        self.data_received_count.set(self.data_received_count.get() + 1);
    }

    pub(crate) fn note_request_processed(&self) {
        self.request_processed_count.set(self.request_processed_count.get() + 1);
    }

    /// Not driven by `relay-core` itself (the spec names the counter but
    /// no operation increments it at this layer — reconnect policy is an
    /// application concern); exposed so an application's
    /// `on_connection_lost` hook can record a retry attempt.
    pub fn note_reconnect_retry(&self) {
        self.reconnect_retry_count.set(self.reconnect_retry_count.get() + 1);
    }
}

/// The application-supplied contract a [`Connection`] routes bytes through
/// (spec §6). Required: [`ProtocolConsumer::data_received`]. The rest have
/// default no-op implementations.
pub trait ProtocolConsumer {
    /// Consume as much of `data` as a complete protocol unit allows,
    /// returning the number of bytes consumed. Spec §4.7 phrases this as
    /// "leftover bytes or null"; returning a consumed length instead of a
    /// leftover slice carries the same information without borrowing
    /// `data` back out past the call.
    fn data_received(&mut self, ctx: &ConsumerContext, data: &[u8]) -> crate::error::CoreResult<usize>;

    /// Called once, right after this consumer becomes the connection's
    /// current consumer (spec §4.7: "triggers `pre_request`" on the
    /// connection side; this is the consumer-side hook for the same
    /// moment).
    fn start_request(&mut self, _ctx: &ConsumerContext) {}

    fn on_connection_made(&mut self, _ctx: &ConsumerContext) {}

    fn on_connection_lost(&mut self, _ctx: &ConsumerContext, _err: Option<&Failure>) {}
}
