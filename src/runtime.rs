//! The external collaborator this crate schedules onto: something that can
//! run a closure "soon" (on its next turn) or "later" (after a delay).
//!
//! `relay-core` owns no I/O and no thread of its own — per spec §6 it is
//! handed an `EventLoop` by its host and only ever reaches it for two
//! things: yielding control back to the loop (`GeneratorDriver`'s
//! `Step::NotDone` handling) and arming/disarming idle timeouts
//! (`Connection`). The trait shape is grounded on
//! `spark-core::runtime::task::TaskHandle` — a host-independent control
//! handle returned from scheduling a unit of work — narrowed to the two
//! operations this crate actually needs instead of the teacher's full
//! task-supervision surface (cancellation strategies, join futures, and so
//! on belong to a real executor, not to this library).

use std::time::Duration;

/// A single-threaded scheduling surface. Implementations typically wrap a
/// `tokio::runtime::Handle`, a `glib::MainContext`, or a hand-rolled
/// reactor — `relay-core` does not care which, as long as `call_soon` and
/// `call_later` eventually run the closure on the same thread that owns
/// the `Deferred`/`Connection`/`Producer` instances scheduling onto it.
pub trait EventLoop {
    /// Schedule `task` to run on this loop's next turn.
    fn call_soon(&self, task: Box<dyn FnOnce()>);

    /// Schedule `task` to run after `delay`, returning a handle that can
    /// cancel it before it fires.
    fn call_later(&self, delay: Duration, task: Box<dyn FnOnce()>) -> Box<dyn TimerHandle>;
}

/// Handle to a pending `call_later` task.
pub trait TimerHandle {
    /// Cancel the pending task. A no-op if it already fired or was already
    /// cancelled.
    fn cancel(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! An `EventLoop` for unit tests: `call_soon` runs the task inline.
    //! `call_later` arms the task but leaves it pending — a test calls
    //! [`ImmediateLoop::fire_timers`] to simulate "the configured delay
    //! elapsed" on its own schedule, the same doubling-as-a-fake-clock
    //! pattern `tests/pipeline_scenarios.rs`'s own `TestLoop` uses.
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    pub struct ImmediateLoop {
        timers: RefCell<Vec<Rc<RefCell<Option<Box<dyn FnOnce()>>>>>>,
    }

    struct ImmediateTimer {
        slot: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
    }

    impl TimerHandle for ImmediateTimer {
        fn cancel(&self) {
            self.slot.borrow_mut().take();
        }
    }

    impl EventLoop for ImmediateLoop {
        fn call_soon(&self, task: Box<dyn FnOnce()>) {
            task();
        }

        fn call_later(&self, _delay: Duration, task: Box<dyn FnOnce()>) -> Box<dyn TimerHandle> {
            let slot = Rc::new(RefCell::new(Some(task)));
            self.timers.borrow_mut().push(Rc::clone(&slot));
            Box::new(ImmediateTimer { slot })
        }
    }

    impl ImmediateLoop {
        pub fn new() -> Rc<Self> {
            Rc::new(ImmediateLoop::default())
        }

        /// Fire every still-armed `call_later` task, oldest first, then
        /// forget them — lets a test simulate a timeout elapsing without a
        /// real clock.
        pub fn fire_timers(&self) {
            let pending: Vec<_> = self.timers.borrow_mut().drain(..).collect();
            for slot in pending {
                if let Some(task) = slot.borrow_mut().take() {
                    task();
                }
            }
        }
    }
}
