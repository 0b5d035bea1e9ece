//! Small shared vocabulary used across the deferred engine and the
//! pipeline layer.

use std::any::Any;
use std::rc::Rc;

/// Dynamically-typed payload carried by repeatable and one-shot events.
///
/// The Python mixin this crate's [`crate::event::EventRegistry`] replaces
/// dispatches arbitrary `data` to listeners; Rust has no equivalent of
/// "any value, decided at the call site" without type erasure. `Rc<dyn
/// Any>` is the single-threaded analogue of the teacher's own
/// `Loopback::fire_loopback_inbound(&self, event: impl Any + Send + Sync)`
/// (`spark-core::common`) — same idea, `Send + Sync` dropped because this
/// engine never crosses a thread boundary (see §5 of SPEC_FULL.md).
pub type EventPayload = Rc<dyn Any>;

/// Wrap a concrete value as an [`EventPayload`].
pub fn payload<T: 'static>(value: T) -> EventPayload {
    Rc::new(value)
}

/// Erase an already-`Rc`'d value into an [`EventPayload`] without the
/// double indirection `payload(Rc::clone(&owner))` would add — used
/// wherever a fired event's data is "the handler itself" (spec §4.6's
/// `fire_event(name, data=SELF)` default).
pub fn payload_owner<T: 'static>(owner: Rc<T>) -> EventPayload {
    owner as EventPayload
}

/// Asserts, in debug builds only, that the calling thread matches the
/// thread that created the enclosing object. Mirrors the "thread affinity"
/// design note in SPEC_FULL.md §5: `Deferred`, `EventRegistry`,
/// `Connection`, and `Producer` are internally `Rc`/`RefCell`-backed and
/// are simply not `Send`, but a stray same-thread re-entrant call from an
/// unexpected context (e.g. a signal handler shim) is still worth catching
/// early.
#[derive(Debug)]
pub struct ThreadAffinity {
    owner: std::thread::ThreadId,
}

impl ThreadAffinity {
    pub fn current() -> Self {
        ThreadAffinity {
            owner: std::thread::current().id(),
        }
    }

    #[inline]
    pub fn assert_on_owner_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "relay-core type accessed from a thread other than the one that created it"
        );
    }
}

/// Render a caught panic payload as a string, shared by every call site
/// that swallows a panic instead of letting it unwind past a crate
/// boundary ([`crate::deferred::support::guarded`],
/// [`crate::event::EventRegistry`]'s listener dispatch).
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
