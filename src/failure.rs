//! [`Failure`] — an accumulating, append-only record of one or more errors
//! that flows through a [`crate::deferred::Deferred`] chain as an ordinary
//! value (spec §3, §4.1).

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::CoreError;
use crate::observability::Logger;

/// A single captured error: its kind (a stable, human-facing label — in
/// practice the `Display` of the error's type), the error value itself,
/// and whatever trace information was available when it was captured.
#[derive(Clone)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub value: Rc<dyn std::error::Error>,
    pub trace: Trace,
}

impl fmt::Debug for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecord")
            .field("kind", &self.kind)
            .field("value", &self.value.to_string())
            .field("trace", &self.trace)
            .finish()
    }
}

/// Trace information attached to an [`ErrorRecord`].
///
/// `original_source/pulsar/async/defer.py` distinguishes a live `(type,
/// value, traceback)` triple from a pre-formatted `remote_stacktrace` used
/// once a `Failure` has been pickled for cross-process transport. `Trace`
/// mirrors that split: `Captured` holds a live backtrace, `Formatted` holds
/// the already-rendered frame strings produced by
/// [`Failure::to_portable`].
#[derive(Clone, Debug)]
pub enum Trace {
    Captured(Rc<std::backtrace::Backtrace>),
    Formatted(Vec<String>),
    None,
}

impl Trace {
    fn format(&self) -> Vec<String> {
        match self {
            Trace::Captured(bt) => bt.to_string().lines().map(str::to_owned).collect(),
            Trace::Formatted(lines) => lines.clone(),
            Trace::None => Vec::new(),
        }
    }
}

/// Accumulates one or more error records. Append-only; logs at most once
/// over its lifetime (spec §4.1 invariants).
///
/// `Clone`able so that a settled [`crate::deferred::Outcome`] can be handed
/// to both a chain's continuation and any other listener still registered
/// on the same settled value (see the `T: Clone` note on
/// [`crate::deferred::Deferred`]). Cloning copies the record list and the
/// "already logged" latch — a clone made after `log()` has run will not
/// log again either.
#[derive(Clone)]
pub struct Failure {
    records: Vec<ErrorRecord>,
    logged: Cell<bool>,
}

impl Default for Failure {
    fn default() -> Self {
        Failure::new()
    }
}

impl Failure {
    /// An empty failure with no records. Matches `Failure(err=None)` in
    /// `original_source` — used as an accumulator that `append` grows.
    pub fn new() -> Self {
        Failure {
            records: Vec::new(),
            logged: Cell::new(false),
        }
    }

    /// Construct from a single error value, capturing a fresh backtrace.
    pub fn from_error<E: std::error::Error + 'static>(kind: &'static str, error: E) -> Self {
        let mut failure = Failure::new();
        failure.push_record(ErrorRecord {
            kind,
            value: Rc::new(error),
            trace: Trace::Captured(Rc::new(std::backtrace::Backtrace::capture())),
        });
        failure
    }

    /// Construct from an explicit `(kind, value, trace)` triple — the Rust
    /// rendition of `Failure((class, value, trace))` in `original_source`.
    pub fn from_record(record: ErrorRecord) -> Self {
        let mut failure = Failure::new();
        failure.push_record(record);
        failure
    }

    fn push_record(&mut self, record: ErrorRecord) {
        self.records.push(record);
        // A fresh record invalidates the "already logged" latch: a Failure
        // that picks up a new error after being logged should be logged
        // again once more errors have accumulated. This mirrors the
        // `_failure_logged` flag living on the *tail* error value in
        // `original_source` (a flag on a brand-new record has never been
        // set), translated to the single-bool side channel noted in
        // SPEC_FULL.md §4.1.
        self.logged.set(false);
    }

    /// Extend with all the records of another `Failure`, a single error, or
    /// a pre-built [`ErrorRecord`] — the Rust union of
    /// `original_source`'s `Failure.append(trace)` accepting a `Failure`,
    /// an `Exception`, or a stack-trace triple.
    pub fn append(&mut self, other: impl Into<FailureSource>) -> &mut Self {
        match other.into() {
            FailureSource::Failure(f) => self.records.extend(f.records),
            FailureSource::Record(r) => self.push_record(r),
        }
        self
    }

    /// Drop all accumulated records (used by `GeneratorDriver` on
    /// `CLEAR_ERRORS`/`Step::ClearErrors`).
    pub fn clear(&mut self) {
        self.records.clear();
        self.logged.set(false);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The most recently appended record, if any.
    pub fn trace(&self) -> Option<&ErrorRecord> {
        self.records.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ErrorRecord> {
        self.records.iter()
    }

    /// Log every accumulated record at `Critical` severity through
    /// `logger`, exactly once across this `Failure`'s lifetime. Subsequent
    /// calls (until a new record is appended) are no-ops.
    pub fn log(&self, logger: &dyn Logger) {
        if self.logged.get() {
            return;
        }
        self.logged.set(true);
        for record in &self.records {
            logger.critical(
                "relay_core::failure",
                format!("{}: {}", record.kind, record.value).into(),
                Some(record.value.as_ref()),
            );
        }
    }

    /// Pop and re-raise a single record (spec §4.1, §9 Open Question a).
    ///
    /// `first` selects *which record to inspect* when deciding whether to
    /// re-raise at all — index `0` if `true`, the last index otherwise —
    /// but the record that is physically removed and returned is always
    /// the **last** one in the list, reproducing
    /// `original_source::Failure.raise_all`'s `self.traces.pop()` call,
    /// which pops from the tail unconditionally even when `first=True`.
    /// This is preserved verbatim per the Open Question: it may be a
    /// pre-existing quirk in the original, but "fixing" it would be a
    /// guess at unstated intent, so the observable behavior (re-raise one
    /// record, leave the rest for a later `log`) is kept exactly.
    pub fn raise_all(&mut self, first: bool) -> Result<Rc<dyn std::error::Error>, CoreError> {
        let inspect_at = if first { 0 } else { self.records.len().saturating_sub(1) };
        self.log_via_default();
        if self.records.get(inspect_at).is_some() {
            let record = self.records.pop().expect("checked above");
            Ok(record.value)
        } else {
            let count = self.records.len();
            Err(CoreError::DeferredFailure { count })
        }
    }

    /// `raise_all` logs unconditionally before deciding its outcome, same
    /// as `original_source` calling `self.log()` on both branches. Since
    /// `raise_all` doesn't carry a `Logger` parameter in spec.md (it is a
    /// pure accumulator operation at that point), this falls back to the
    /// crate's [`crate::observability::TracingLogger`] default.
    fn log_via_default(&self) {
        self.log(&crate::observability::TracingLogger);
    }

    #[cfg(feature = "serde")]
    pub fn to_portable(&self) -> PortableFailure {
        PortableFailure {
            records: self
                .records
                .iter()
                .map(|r| PortableRecord {
                    kind: r.kind.to_string(),
                    message: r.value.to_string(),
                    trace: r.trace.format(),
                })
                .collect(),
        }
    }
}

/// The union of things [`Failure::append`] accepts.
pub enum FailureSource {
    Failure(Failure),
    Record(ErrorRecord),
}

impl From<Failure> for FailureSource {
    fn from(value: Failure) -> Self {
        FailureSource::Failure(value)
    }
}

impl From<ErrorRecord> for FailureSource {
    fn from(value: ErrorRecord) -> Self {
        FailureSource::Record(value)
    }
}

impl<E: std::error::Error + 'static> From<(&'static str, E)> for FailureSource {
    fn from((kind, error): (&'static str, E)) -> Self {
        FailureSource::Record(ErrorRecord {
            kind,
            value: Rc::new(error),
            trace: Trace::Captured(Rc::new(std::backtrace::Backtrace::capture())),
        })
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure").field("records", &self.records).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", record.kind, record.value)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.records.last().map(|r| r.value.as_ref())
    }
}

impl std::ops::Index<usize> for Failure {
    type Output = ErrorRecord;

    fn index(&self, index: usize) -> &Self::Output {
        &self.records[index]
    }
}

impl<'a> IntoIterator for &'a Failure {
    type Item = &'a ErrorRecord;
    type IntoIter = std::slice::Iter<'a, ErrorRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Portable (serializable) form of a [`Failure`], produced by
/// [`Failure::to_portable`]. Any live backtrace is rendered to a list of
/// strings before this value is built, matching
/// `original_source::Failure.__getstate__`'s conversion of live tracebacks
/// into `remote_stacktrace` triples ahead of pickling.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PortableFailure {
    pub records: Vec<PortableRecord>,
}

#[cfg(feature = "serde")]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PortableRecord {
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom(&'static str);
    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom: {}", self.0)
        }
    }
    impl std::error::Error for Boom {}

    #[test]
    fn log_is_idempotent_until_new_record_appended() {
        let mut failure = Failure::from_error("test", Boom("a"));
        let logger = crate::observability::TracingLogger;
        assert!(!failure.logged.get());
        failure.log(&logger);
        assert!(failure.logged.get());
        failure.log(&logger); // no-op, would double count if it weren't
        failure.append(("test", Boom("b")));
        assert!(!failure.logged.get(), "appending should reset the latch");
    }

    #[test]
    fn append_failure_extends_with_all_records() {
        let mut a = Failure::from_error("test", Boom("a"));
        let b = Failure::from_error("test", Boom("b"));
        a.append(b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn trace_returns_most_recent_record() {
        let mut failure = Failure::new();
        failure.append(("test", Boom("a")));
        failure.append(("test", Boom("b")));
        assert_eq!(failure.trace().unwrap().value.to_string(), "boom: b");
        assert!(Failure::new().trace().is_none());
    }

    #[test]
    fn raise_all_pops_from_the_tail_regardless_of_first() {
        let mut failure = Failure::new();
        failure.append(("test", Boom("a")));
        failure.append(("test", Boom("b")));
        // first=true still inspects index 0 (exists) but pops the tail ("b").
        let raised = failure.raise_all(true).unwrap();
        assert_eq!(raised.to_string(), "boom: b");
        assert_eq!(failure.len(), 1);
        assert_eq!(failure[0].value.to_string(), "boom: a");
    }

    #[test]
    fn raise_all_on_empty_reports_count() {
        let mut failure = Failure::new();
        let err = failure.raise_all(true).unwrap_err();
        match err {
            CoreError::DeferredFailure { count } => assert_eq!(count, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
