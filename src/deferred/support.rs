//! Free functions lifting plain values, fallible synchronous work, and
//! panicking closures into the `Deferred` vocabulary — the Rust rendition
//! of the module-level helpers in `original_source/pulsar/async/defer.py`
//! (`is_async`, `maybe_async`, `safe_async`, and the `@async` decorator).
//!
//! Python's versions inspect a runtime value to decide whether it is "the
//! kind of thing you can call `addCallback` on"; Rust's type system makes
//! that decision at compile time instead; these helpers are narrower and
//! typed accordingly, but cover the same call sites.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{Deferred, Outcome};
use crate::common::panic_message;
use crate::failure::Failure;

/// Wrap an already-available value as a settled [`Outcome`] — the trivial
/// case of `maybe_async`, where the input was never deferred at all.
pub fn as_value<T>(value: T) -> Outcome<T> {
    Outcome::Value(value)
}

/// Run `body` and package whatever it produces as an already-settled
/// `Deferred`, the way `original_source`'s `safe_async` guarantees its
/// wrapped function always returns a `Deferred` even when the body raises
/// synchronously (there: by catching the exception and building a
/// `Failure` from it inline).
pub fn safe_async<T: Clone + 'static>(body: impl FnOnce() -> Result<T, Failure>) -> Deferred<T> {
    match body() {
        Ok(value) => Deferred::settled(value),
        Err(failure) => Deferred::failed(failure),
    }
}

/// Like [`safe_async`], but also catches a Rust panic unwinding out of
/// `body` and folds it into a [`Failure`] instead of propagating it. This
/// is the closest Rust analogue of the `@async` decorator wrapping a
/// callable so that *nothing* it does — return, raise, or (in Python)
/// `yield` — can escape the `Deferred` it produces.
pub fn guarded<T: Clone + 'static>(
    body: impl FnOnce() -> Result<T, Failure> + std::panic::UnwindSafe,
) -> Deferred<T> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Deferred::settled(value),
        Ok(Err(failure)) => Deferred::failed(failure),
        Err(panic) => {
            let message = panic_message(&panic);
            Deferred::failed(Failure::from_error("panic", PanicError(message)))
        }
    }
}

#[derive(Debug)]
struct PanicError(String);

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panicked: {}", self.0)
    }
}

impl std::error::Error for PanicError {}
