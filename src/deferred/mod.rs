//! [`Deferred`] — a single-assignment, chainable asynchronous value (spec
//! §3, §4.2), plus the lifting helpers (§4.3) that convert plain values,
//! `Result`s, and stepwise producers into the same vocabulary.
//!
//! **Design note (see SPEC_FULL.md §3).** Python's `Deferred` is
//! dynamically typed: any callback may change the runtime type of
//! `result`. Rust's `Deferred<T>` fixes `T` for the chain's lifetime, and
//! additionally requires `T: Clone` — needed once a callback returns
//! another pending `Deferred<T>` (§4.2 invariant I6): the settled value
//! must be handed to both the outer chain's continuation and (potentially)
//! to other listeners still registered on the inner deferred, and Rust has
//! no notion of two owners sharing one value without either `Rc` or
//! `Clone`. Every literal scenario in spec.md §8 is satisfied by this
//! restriction.

mod support;

pub mod generator;
pub mod multi;

pub use support::{as_value, guarded, safe_async};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::common::ThreadAffinity;
use crate::error::{CoreError, CoreResult};
use crate::failure::Failure;

/// Either a settled value or an accumulated [`Failure`] — the Rust
/// rendition of "result may be a Failure" (spec §3).
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Failure(Failure),
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Value(v) => Outcome::Value(v.clone()),
            Outcome::Failure(f) => Outcome::Failure(f.clone()),
        }
    }
}

impl<T> Outcome<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

/// What a callback/errback hands back to the draining loop: a settled
/// value, a failure, or a still-pending nested `Deferred` (spec §4.2 step
/// 5, invariant I6). Collapsing "returned a value" / "raised" / "returned
/// a Deferred" into one return type is this crate's Rust-idiomatic
/// replacement for `_run_callbacks`' dynamic post-processing (see
/// SPEC_FULL.md §3): a callback simply cannot "raise" here, it returns
/// `Resolution::Failure` instead.
pub enum Resolution<T> {
    Value(T),
    Failure(Failure),
    Pending(Deferred<T>),
}

type CallbackFn<T> = Box<dyn FnOnce(T) -> Resolution<T>>;
type ErrbackFn<T> = Box<dyn FnOnce(Failure) -> Resolution<T>>;

struct DeferredState<T> {
    description: Option<String>,
    called: bool,
    running: bool,
    paused: u32,
    queue: VecDeque<(CallbackFn<T>, ErrbackFn<T>)>,
    result: Option<Outcome<T>>,
}

/// A single-assignment async value with an ordered callback/errback chain.
///
/// `Deferred<T>` is a cheap-to-clone handle (an `Rc` around shared
/// interior-mutable state) — cloning shares the same underlying deferred,
/// it does not create an independent one. This is deliberate: callers
/// frequently need to hold onto a `Deferred` while also handing a clone to
/// a callback closure (see [`Deferred::add_both`]'s continuation wiring).
pub struct Deferred<T> {
    inner: Rc<RefCell<DeferredState<T>>>,
    affinity: Rc<ThreadAffinity>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: Rc::clone(&self.inner),
            affinity: Rc::clone(&self.affinity),
        }
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new() -> Self {
        Deferred::with_description_opt(None)
    }

    pub fn with_description(description: impl Into<String>) -> Self {
        Deferred::with_description_opt(Some(description.into()))
    }

    fn with_description_opt(description: Option<String>) -> Self {
        Deferred {
            inner: Rc::new(RefCell::new(DeferredState {
                description,
                called: false,
                running: false,
                paused: 0,
                queue: VecDeque::new(),
                result: None,
            })),
            affinity: Rc::new(ThreadAffinity::current()),
        }
    }

    /// A `Deferred` that is already settled with `value` — the Rust
    /// rendition of `make_async(val)` wrapping a plain value.
    pub fn settled(value: T) -> Self {
        let d = Deferred::new();
        d.callback(value).expect("fresh deferred cannot already be called");
        d
    }

    /// A `Deferred` that is already settled with `failure`.
    pub fn failed(failure: Failure) -> Self {
        let d = Deferred::new();
        d.fail(failure).expect("fresh deferred cannot already be called");
        d
    }

    pub fn called(&self) -> bool {
        self.inner.borrow().called
    }

    pub fn running(&self) -> bool {
        self.inner.borrow().running
    }

    pub fn paused(&self) -> u32 {
        self.inner.borrow().paused
    }

    pub fn description(&self) -> Option<String> {
        self.inner.borrow().description.clone()
    }

    /// `true` once `called` is true, the callback queue is drained, and the
    /// pause depth is zero (spec invariant I4).
    pub fn is_settled(&self) -> bool {
        let state = self.inner.borrow();
        state.called && state.queue.is_empty() && state.paused == 0
    }

    /// Appends `(cb, eb)` to the callback queue; if this deferred is
    /// already settled (and not currently running or paused), runs the
    /// pair immediately, synchronously, in the caller's context (invariant
    /// I5).
    pub fn add_callback(
        &self,
        cb: impl FnOnce(T) -> Resolution<T> + 'static,
        eb: impl FnOnce(Failure) -> Resolution<T> + 'static,
    ) -> Self {
        self.inner
            .borrow_mut()
            .queue
            .push_back((Box::new(cb), Box::new(eb)));
        self.run_callbacks();
        self.clone()
    }

    /// Pass-through on success, `eb` on failure.
    pub fn add_errback(&self, eb: impl FnOnce(Failure) -> Resolution<T> + 'static) -> Self {
        self.add_callback(|v| Resolution::Value(v), eb)
    }

    /// The same handler for both slots, unified over [`Outcome<T>`] since
    /// the callback and errback slots take different argument types in
    /// Rust (unlike Python, where the same callable serves both because
    /// arguments are dynamically typed).
    pub fn add_both(&self, cb: impl Fn(Outcome<T>) -> Resolution<T> + 'static) -> Self {
        let cb = Rc::new(cb);
        let cb_ok = Rc::clone(&cb);
        self.add_callback(
            move |v| (cb_ok)(Outcome::Value(v)),
            move |f| (cb)(Outcome::Failure(f)),
        )
    }

    /// Settle this deferred with a successful value. Fails with
    /// [`CoreError::AlreadyCalled`] if already called (invariant I1).
    pub fn callback(&self, result: T) -> CoreResult<()> {
        self.settle(Outcome::Value(result))
    }

    /// Settle this deferred with a [`Failure`]. Not named in spec §4.2's
    /// bullet list (which only shows `callback(result)`), but required:
    /// Python's dynamic `callback` accepts a `Failure` as `result`
    /// directly (`as_failure` is a no-op on an already-built `Failure`),
    /// which Rust's `callback(result: T)` cannot express once `T != Failure`.
    pub fn fail(&self, failure: Failure) -> CoreResult<()> {
        self.settle(Outcome::Failure(failure))
    }

    fn settle(&self, outcome: Outcome<T>) -> CoreResult<()> {
        self.affinity.assert_on_owner_thread();
        {
            let mut state = self.inner.borrow_mut();
            if state.called {
                return Err(CoreError::already_called(
                    state.description.clone().unwrap_or_else(|| "Deferred".to_string()),
                ));
            }
            state.result = Some(outcome);
            state.called = true;
        }
        self.run_callbacks();
        Ok(())
    }

    /// Returns the settled [`Outcome`] if `called` is true, the queue is
    /// drained, and the pause depth is zero; otherwise returns this
    /// deferred back (as a cheap clone) so the caller can keep waiting on
    /// it. This is the Rust rendition of "returns `result` if settled,
    /// else returns the deferred itself" (spec §4.2) — `Result` stands in
    /// for the dynamic either/or.
    pub fn result_or_self(&self) -> Result<Outcome<T>, Deferred<T>> {
        let state = self.inner.borrow();
        if state.called && state.queue.is_empty() && state.paused == 0 {
            Ok(state.result.clone().expect("called implies a result"))
        } else {
            drop(state);
            Err(self.clone())
        }
    }

    fn run_callbacks(&self) {
        self.affinity.assert_on_owner_thread();
        loop {
            let pair = {
                let mut state = self.inner.borrow_mut();
                if !state.called || state.running || state.paused > 0 {
                    return;
                }
                match state.queue.pop_front() {
                    Some(pair) => pair,
                    None => return,
                }
            };

            let input = {
                let mut state = self.inner.borrow_mut();
                state.result.take().expect("drained only once called")
            };
            let is_failure = input.is_failure();

            self.inner.borrow_mut().running = true;
            let (cb, eb) = pair;
            let resolution = match (is_failure, input) {
                (true, Outcome::Failure(f)) => eb(f),
                (false, Outcome::Value(v)) => cb(v),
                _ => unreachable!("is_failure was computed from the same input"),
            };
            self.inner.borrow_mut().running = false;

            match resolution {
                Resolution::Pending(inner_deferred) => {
                    self.inner.borrow_mut().paused += 1;
                    let outer = self.clone();
                    inner_deferred.add_both(move |outcome| outer.continue_with(outcome));
                    return;
                }
                Resolution::Value(v) => {
                    self.inner.borrow_mut().result = Some(Outcome::Value(v));
                }
                Resolution::Failure(f) => {
                    self.inner.borrow_mut().result = Some(Outcome::Failure(f));
                }
            }
        }
    }

    /// The continuation chained onto an inner deferred after a pause
    /// (invariant I6): `this.result = result; unpause; return result`.
    fn continue_with(&self, outcome: Outcome<T>) -> Resolution<T> {
        {
            let mut state = self.inner.borrow_mut();
            state.paused = state.paused.saturating_sub(1);
            state.result = Some(outcome.clone());
        }
        self.run_callbacks();
        match outcome {
            Outcome::Value(v) => Resolution::Value(v),
            Outcome::Failure(f) => Resolution::Failure(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boom(msg: &'static str) -> Failure {
        Failure::from_error("test", TestError(msg))
    }

    #[derive(Debug)]
    struct TestError(&'static str);
    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[test]
    fn chain_with_mid_failure_and_recovery() {
        // spec §8 scenario 1
        let d: Deferred<i64> = Deferred::new();
        d.add_callback(|x| Resolution::Value(x + 1), |f| Resolution::Failure(f));
        d.add_callback(
            |_x| Resolution::Failure(boom("boom")),
            |f| Resolution::Failure(f),
        );
        d.add_errback(|_f| Resolution::Value(42));
        d.add_callback(|x| Resolution::Value(x * 2), |f| Resolution::Failure(f));
        d.callback(1).unwrap();
        match d.result_or_self() {
            Ok(Outcome::Value(v)) => assert_eq!(v, 84),
            other => panic!("expected settled value 84, got pending/failure: {}", matches!(other, Err(_))),
        }
    }

    #[test]
    fn nested_deferred_pause() {
        // spec §8 scenario 2
        let d: Deferred<String> = Deferred::new();
        let inner: Deferred<String> = Deferred::new();
        let inner_for_cb = inner.clone();
        d.add_callback(
            move |_v| Resolution::Pending(inner_for_cb.clone()),
            |f| Resolution::Failure(f),
        );
        d.add_callback(|v| Resolution::Value(format!("{v}!")), |f| Resolution::Failure(f));
        d.callback(String::new()).unwrap();
        assert!(!d.is_settled());
        inner.callback("hi".to_string()).unwrap();
        match d.result_or_self() {
            Ok(Outcome::Value(v)) => assert_eq!(v, "hi!"),
            _ => panic!("expected settled value"),
        }
    }

    #[test]
    fn double_callback_fails_with_already_called() {
        let d: Deferred<i64> = Deferred::new();
        d.callback(1).unwrap();
        let err = d.callback(2).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyCalled { .. }));
    }

    #[test]
    fn add_callback_to_settled_deferred_runs_synchronously() {
        let d: Deferred<i64> = Deferred::new();
        d.callback(10).unwrap();
        let observed = Rc::new(RefCell::new(None));
        let observed_cb = Rc::clone(&observed);
        d.add_callback(
            move |v| {
                *observed_cb.borrow_mut() = Some(v);
                Resolution::Value(v)
            },
            |f| Resolution::Failure(f),
        );
        assert_eq!(*observed.borrow(), Some(10));
    }

    #[test]
    fn order_of_callbacks_is_registration_order() {
        let d: Deferred<Vec<i32>> = Deferred::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = Rc::clone(&order);
            d.add_callback(
                move |mut v| {
                    order.borrow_mut().push(i);
                    v.push(i);
                    Resolution::Value(v)
                },
                |f| Resolution::Failure(f),
            );
        }
        d.callback(Vec::new()).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
