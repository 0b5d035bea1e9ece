//! A deferred-value engine and the event-driven protocol pipeline built on
//! top of it, for single-threaded, reactor-style network services.
//!
//! The crate is organized in two layers:
//!
//! - [`deferred`] (plus [`failure`]): [`deferred::Deferred`], a
//!   single-assignment asynchronous value with ordered callback/errback
//!   chains; [`deferred::generator::drive`], a state-machine driver for
//!   stepwise producers ([`deferred::generator::StepSource`]) that may
//!   themselves await a `Deferred`; and [`deferred::multi::MultiDeferred`],
//!   which aggregates a collection of deferred values into one.
//! - [`event`] and [`pipeline`]: [`event::EventRegistry`], a reusable
//!   one-shot/repeatable event dispatcher, and the
//!   [`pipeline::Producer`]/[`pipeline::Connection`]/[`pipeline::ProtocolConsumer`]
//!   triad that uses it to route bytes from a host-supplied
//!   [`pipeline::Transport`] through application protocol logic.
//!
//! Neither layer owns a thread, a socket, or an executor. Both are handed
//! an [`runtime::EventLoop`] (and, for the pipeline, a
//! [`pipeline::Transport`]) by the embedding application; `relay-core`
//! schedules onto them but never constructs one itself. Every public type
//! is `Rc`/`RefCell`-backed and assumes a single owning thread — see
//! [`common::ThreadAffinity`] and SPEC_FULL.md §5.

pub mod common;
pub mod error;
pub mod event;
pub mod failure;
pub mod observability;
pub mod runtime;

pub mod deferred;
pub mod pipeline;

pub use common::EventPayload;
pub use error::{CoreError, CoreErrorCategory, CoreResult};
pub use event::{EventNameSet, EventRegistry, NoOneShotEvents};
pub use failure::{ErrorRecord, Failure};
pub use observability::{LogRecord, LogSeverity, Logger, TracingLogger};
pub use runtime::{EventLoop, TimerHandle};

pub use deferred::generator::{drive, Step, StepOutcome, StepSource};
pub use deferred::multi::{Container, FromContainer, MultiDeferred, MultiInput};
pub use deferred::{Deferred, Outcome, Resolution};

pub use pipeline::{
    Connection, ConnectionFactory, ConnectionManyEvent, ConnectionOneShotEvent, ConsumerContext, ConsumerManyEvent,
    ConsumerOneShotEvent, Producer, ProtocolConsumer, Transport,
};
