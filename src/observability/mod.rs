//! Structured logging facade.
//!
//! `relay-core` never writes to stderr directly and never pulls a concrete
//! logging backend into its public API. Instead it defines a small
//! [`Logger`] trait (grounded on `spark-core::observability::logging`) that
//! callers hand in; [`TracingLogger`] is the default implementation wired
//! to the `tracing` crate.

pub mod logging;

pub use logging::{LogRecord, LogSeverity, Logger, TracingLogger};
