//! The event-driven protocol pipeline (spec §2, §4.7–§4.8): a
//! [`Producer`](producer::Producer) creates
//! [`Connection`](connection::Connection)s, each of which routes incoming
//! bytes through a current [`ProtocolConsumer`](consumer::ProtocolConsumer)
//! and fires lifecycle events the Producer, application, or tests observe
//! through an [`EventRegistry`](crate::event::EventRegistry).
//!
//! Grounded on `original_source/pulsar/async/protocols.py`
//! (`ProtocolConsumer`, `Connection`, `Producer`), with the module/file
//! split borrowed from the teacher's own `pipeline/{channel,context,
//! controller}.rs` three-way separation between "the thing being
//! connected", "what a handler sees", and "the thing managing many of
//! them".

pub mod connection;
pub mod consumer;
pub mod producer;
pub mod transport;

pub use connection::{Connection, ConnectionManyEvent, ConnectionOneShotEvent};
pub use consumer::{ConsumerContext, ConsumerManyEvent, ConsumerOneShotEvent, ProtocolConsumer};
pub use producer::{ConnectionFactory, Producer};
pub use transport::Transport;
