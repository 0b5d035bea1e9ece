//! The transport collaborator (spec §6): named at the interface boundary
//! only. `relay-core` never dials, accepts, or reads a socket itself — it
//! only needs a handle it can close and whose driver promises to call
//! [`Connection::connection_made`](super::connection::Connection::connection_made)
//! exactly once, then zero or more
//! [`Connection::data_received`](super::connection::Connection::data_received),
//! then exactly one of `eof_received` / `connection_lost`.

/// A host-supplied byte transport. Concrete wire mechanics (TCP, TLS, unix
/// sockets, an in-memory loopback for tests) are entirely the host's
/// concern; `relay-core` only ever calls [`Transport::close`].
pub trait Transport {
    /// Close the transport. `graceful` requests the host drain any
    /// in-flight writes first instead of tearing the connection down
    /// immediately — the Rust rendition of the `async` flag on
    /// `original_source`'s `Transport.close(async=False)`.
    fn close(&self, graceful: bool);
}

#[cfg(test)]
pub(crate) mod testing {
    //! A transport double for tests: records every `close` call and, to
    //! exercise idle-timeout and cap scenarios without a real reactor,
    //! immediately loops back into the owning `Connection`'s
    //! `connection_lost` the way a real transport driver eventually would
    //! after tearing its socket down.
    use super::Transport;
    use crate::pipeline::connection::Connection;
    use std::cell::Cell;
    use std::rc::{Rc, Weak};

    pub struct LoopbackTransport {
        pub closed: Cell<bool>,
        pub graceful: Cell<Option<bool>>,
        connection: Weak<Connection>,
    }

    impl LoopbackTransport {
        pub fn new(connection: &Rc<Connection>) -> Rc<Self> {
            Rc::new(LoopbackTransport {
                closed: Cell::new(false),
                graceful: Cell::new(None),
                connection: Rc::downgrade(connection),
            })
        }
    }

    impl Transport for LoopbackTransport {
        fn close(&self, graceful: bool) {
            self.closed.set(true);
            self.graceful.set(Some(graceful));
            if let Some(connection) = self.connection.upgrade() {
                connection.connection_lost(None);
            }
        }
    }
}
