//! [`EventRegistry`] — the concrete, reusable struct backing the abstract
//! `EventHandler` mixin from spec §3/§4.6.
//!
//! Python's `EventHandler` is a mixin: a subclass declares two *disjoint*
//! class-level name sets (one-shot, repeatable) and inherits dispatch
//! logic that looks names up in per-instance dicts built from those sets.
//! Rust has no implementation inheritance, and — more usefully — no need
//! to check disjointness at runtime: [`Connection`](crate::pipeline::connection::Connection),
//! [`ProtocolConsumer`](crate::pipeline::consumer)'s context, and
//! [`Producer`](crate::pipeline::producer::Producer) each *own* one
//! `EventRegistry<OneShot, Many>` instance, where `OneShot` and `Many` are
//! two distinct small enums. The compiler enforces that a name cannot be
//! both one-shot and repeatable simply because it cannot belong to two
//! different enum types at once — strictly stronger than spec.md's
//! runtime-checked disjointness (see SPEC_FULL.md §4.6).

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use crate::common::{panic_message, payload, payload_owner, EventPayload};
use crate::deferred::{Deferred, Resolution};
use crate::error::CoreResult;
use crate::observability::{Logger, TracingLogger};

/// A closed, enumerable set of event names. Implemented by the small
/// `Copy` enums each subsystem declares for its one-shot and repeatable
/// event names — the Rust rendition of spec §3's "names are fixed per
/// subclass (declared as two disjoint name sets)".
pub trait EventNameSet: Copy + Eq + Hash + 'static {
    /// Every variant, in a stable order. Used by
    /// [`EventRegistry::copy_many_times_events`] when no explicit subset
    /// of names is given.
    const ALL: &'static [Self];
}

/// An uninhabited [`EventNameSet`] for registries that only ever need a
/// repeatable half — [`Producer`](crate::pipeline::producer::Producer)
/// declares no one-shot events of its own, only a template of repeatable
/// listeners copied onto every connection it creates (spec §4.8 step 4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NoOneShotEvents {}

impl EventNameSet for NoOneShotEvents {
    const ALL: &'static [Self] = &[];
}

fn swallow_panics(
    logger: Rc<dyn Logger>,
    cb: Rc<dyn Fn(EventPayload)>,
) -> Rc<dyn Fn(EventPayload)> {
    Rc::new(move |data: EventPayload| {
        let cb = Rc::clone(&cb);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(data)));
        if let Err(panic) = result {
            let message = panic_message(&panic);
            logger.warn("relay_core::event", format!("event listener panicked: {message}").into());
        }
    })
}

/// Two disjoint, name-indexed event registries: one-shot events backed by
/// a [`Deferred`] (fires at most once, spec §3), and repeatable events
/// backed by an ordered listener list (fires zero or more times).
pub struct EventRegistry<OneShot: EventNameSet, Many: EventNameSet> {
    one_shot: RefCell<HashMap<OneShot, Deferred<EventPayload>>>,
    many: RefCell<HashMap<Many, Vec<Rc<dyn Fn(EventPayload)>>>>,
    logger: Rc<dyn Logger>,
}

impl<OneShot: EventNameSet, Many: EventNameSet> Default for EventRegistry<OneShot, Many> {
    fn default() -> Self {
        EventRegistry::new()
    }
}

impl<OneShot: EventNameSet, Many: EventNameSet> EventRegistry<OneShot, Many> {
    pub fn new() -> Self {
        EventRegistry::with_logger(Rc::new(TracingLogger))
    }

    pub fn with_logger(logger: Rc<dyn Logger>) -> Self {
        EventRegistry {
            one_shot: RefCell::new(HashMap::new()),
            many: RefCell::new(HashMap::new()),
            logger,
        }
    }

    /// The [`Deferred`] backing `name`, created lazily on first touch —
    /// the Rust rendition of "per-instance maps are created at
    /// construction" (spec §3): since `OneShot` is a closed enum there is
    /// no meaningful difference between eagerly building every entry up
    /// front and inserting on first access, and the latter avoids
    /// requiring `OneShot: EventNameSet` to enumerate itself twice.
    fn one_shot_deferred(&self, name: OneShot) -> Deferred<EventPayload> {
        self.one_shot
            .borrow_mut()
            .entry(name)
            .or_insert_with(Deferred::new)
            .clone()
    }

    /// Bind a listener to a one-shot event. The listener is wrapped in an
    /// exception-swallowing adapter (spec §4.6) — here, a panic-catching
    /// adapter, Rust's analogue of a Python exception escaping a
    /// `callback` — and attached as both the callback and errback of the
    /// backing `Deferred`. In practice the errback arm is never exercised:
    /// [`EventRegistry::fire_one_shot`] always settles the deferred via
    /// `callback`, never `fail`, so the errback slot exists only to mirror
    /// spec §4.6's "attaches as both callback and errback" structurally.
    pub fn bind_one_shot(&self, name: OneShot, cb: impl Fn(EventPayload) + 'static) {
        let wrapped = swallow_panics(Rc::clone(&self.logger), Rc::new(cb));
        let deferred = self.one_shot_deferred(name);
        let on_settle = Rc::clone(&wrapped);
        deferred.add_callback(
            move |data: EventPayload| {
                on_settle(data.clone());
                Resolution::Value(data)
            },
            move |f| Resolution::Failure(f),
        );
    }

    /// Fire a one-shot event. A second call on the same `name` fails with
    /// [`crate::error::CoreError::AlreadyCalled`] (spec §8 "event
    /// uniqueness"), since it settles the same backing `Deferred` twice.
    pub fn fire_one_shot(&self, name: OneShot, data: EventPayload) -> CoreResult<()> {
        self.one_shot_deferred(name).callback(data)
    }

    /// Fire a one-shot event with the registry's owner as the payload —
    /// the Rust rendition of `fire_event(name, data=SELF)` (spec §4.6).
    pub fn fire_one_shot_with_owner<T: 'static>(&self, name: OneShot, owner: Rc<T>) -> CoreResult<()> {
        self.fire_one_shot(name, payload_owner(owner))
    }

    pub fn bind_many(&self, name: Many, cb: impl Fn(EventPayload) + 'static) {
        let wrapped = swallow_panics(Rc::clone(&self.logger), Rc::new(cb));
        self.many.borrow_mut().entry(name).or_default().push(wrapped);
    }

    /// Dispatch to every listener bound to `name`, in registration order,
    /// exactly once each — even if some panic (caught and logged, per
    /// spec §8 "event fan-out").
    pub fn fire_many(&self, name: Many, data: EventPayload) {
        let listeners = self.many.borrow().get(&name).cloned().unwrap_or_default();
        for listener in listeners {
            listener(data.clone());
        }
    }

    /// Copy `other`'s repeatable listeners for `names` (or every name in
    /// `Many::ALL` if omitted) into this registry — the Rust rendition of
    /// `copy_many_times_events` (spec §4.6), used by
    /// [`Producer::new_connection`](crate::pipeline::producer::Producer::new_connection)
    /// to propagate its template listeners onto every connection it
    /// creates. The one-shot-collision branch in spec §4.6 ("where a name
    /// collides with one of this handler's one-shot events, attach as a
    /// callback to the one-shot Deferred") cannot arise here: `Many` and
    /// `OneShot` are distinct types, so a repeatable name can never
    /// coincide with a one-shot name at the type level.
    pub fn copy_many_times_events<OtherOneShot: EventNameSet>(
        &self,
        other: &EventRegistry<OtherOneShot, Many>,
        names: Option<&[Many]>,
    ) {
        let names: Vec<Many> = names.map(|n| n.to_vec()).unwrap_or_else(|| Many::ALL.to_vec());
        for name in names {
            let listeners = other.many.borrow().get(&name).cloned().unwrap_or_default();
            if listeners.is_empty() {
                continue;
            }
            self.many.borrow_mut().entry(name).or_default().extend(listeners);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum OneShotName {
        Finish,
    }
    impl EventNameSet for OneShotName {
        const ALL: &'static [Self] = &[OneShotName::Finish];
    }

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum ManyName {
        Tick,
    }
    impl EventNameSet for ManyName {
        const ALL: &'static [Self] = &[ManyName::Tick];
    }

    #[test]
    fn one_shot_fires_at_most_once() {
        let registry: EventRegistry<OneShotName, ManyName> = EventRegistry::new();
        assert!(registry.fire_one_shot(OneShotName::Finish, payload(1i32)).is_ok());
        assert!(registry.fire_one_shot(OneShotName::Finish, payload(2i32)).is_err());
    }

    #[test]
    fn binding_after_fire_runs_synchronously_with_latched_value() {
        let registry: EventRegistry<OneShotName, ManyName> = EventRegistry::new();
        registry.fire_one_shot(OneShotName::Finish, payload(7i32)).unwrap();
        let seen = Rc::new(StdRefCell::new(0));
        let seen_cb = Rc::clone(&seen);
        registry.bind_one_shot(OneShotName::Finish, move |data| {
            *seen_cb.borrow_mut() = *data.downcast_ref::<i32>().unwrap();
        });
        assert_eq!(*seen.borrow(), 7);
    }

    #[test]
    fn many_fires_every_listener_in_order_even_if_one_panics() {
        let registry: EventRegistry<OneShotName, ManyName> = EventRegistry::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        registry.bind_many(ManyName::Tick, move |_| o1.borrow_mut().push(1));
        registry.bind_many(ManyName::Tick, |_| panic!("listener blew up"));
        let o3 = Rc::clone(&order);
        registry.bind_many(ManyName::Tick, move |_| o3.borrow_mut().push(3));
        registry.fire_many(ManyName::Tick, payload(()));
        assert_eq!(*order.borrow(), vec![1, 3]);
    }

    #[test]
    fn copy_many_times_events_propagates_listeners() {
        let source: EventRegistry<OneShotName, ManyName> = EventRegistry::new();
        let seen = Rc::new(StdRefCell::new(0));
        let seen_cb = Rc::clone(&seen);
        source.bind_many(ManyName::Tick, move |data| {
            *seen_cb.borrow_mut() += *data.downcast_ref::<i32>().unwrap();
        });

        let target: EventRegistry<NoOneShotEvents, ManyName> = EventRegistry::new();
        target.copy_many_times_events(&source, None);
        target.fire_many(ManyName::Tick, payload(5i32));
        assert_eq!(*seen.borrow(), 5);
    }
}
