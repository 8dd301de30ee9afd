//! Connection pool.
//!
//! Closed connections are cleared and parked here so their way buffers
//! (the heavy allocations) are reused by the next checkout instead of
//! reallocated. The pool is owned by the helper and only touched from the
//! controller thread.

use tracing::debug;

use crate::connection::Connection;

pub(crate) struct ConnectionPool {
    enabled: bool,
    inbound_capacity: usize,
    outbound_capacity: usize,
    client_side: bool,
    idle: Vec<Connection>,
}

impl ConnectionPool {
    /// Preallocates `initial` cleared connections when pooling is enabled.
    pub(crate) fn new(
        enabled: bool,
        initial: usize,
        inbound_capacity: usize,
        outbound_capacity: usize,
        client_side: bool,
    ) -> Self {
        let idle = if enabled {
            (0..initial)
                .map(|_| Connection::detached(inbound_capacity, outbound_capacity, client_side))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            enabled,
            inbound_capacity,
            outbound_capacity,
            client_side,
            idle,
        }
    }

    /// Takes a cleared connection, reusing a pooled one when available.
    pub(crate) fn checkout(&mut self) -> Connection {
        match self.idle.pop() {
            Some(connection) => connection,
            None => {
                if self.enabled {
                    debug!("connection pool empty, allocating");
                }
                Connection::detached(
                    self.inbound_capacity,
                    self.outbound_capacity,
                    self.client_side,
                )
            }
        }
    }

    /// Clears a closed connection and parks it for reuse. With pooling
    /// disabled the connection is simply dropped.
    pub(crate) fn checkin(&mut self, mut connection: Connection) {
        if !self.enabled {
            return;
        }
        connection.clear();
        self.idle.push(connection);
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;
    use crate::state::ConnectionState;
    use mio::net::TcpStream;
    use std::net::TcpListener as StdTcpListener;

    #[test]
    fn checkout_prefers_pooled_connections() {
        let mut pool = ConnectionPool::new(true, 2, 64, 64, true);
        assert_eq!(pool.idle_count(), 2);
        let conn = pool.checkout();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn empty_pool_allocates_fresh_connections() {
        let mut pool = ConnectionPool::new(true, 0, 64, 64, true);
        let conn = pool.checkout();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn checkin_then_checkout_reuses_the_buffers() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut pool = ConnectionPool::new(true, 1, 1024, 1024, true);
        let mut conn = pool.checkout();
        let stream = TcpStream::connect(addr).unwrap();
        conn.open_client(1000, stream, addr, None, false, true, None);
        let buffer_ptr = conn.inbound_buffer_ptr();

        conn.force_close(&Status::connector_error_communication("recycle"));
        pool.checkin(conn);
        assert_eq!(pool.idle_count(), 1);

        let mut reused = pool.checkout();
        // LIFO: the connection just checked in comes back first, cleared
        // but with its buffer allocation intact.
        assert_eq!(reused.inbound_buffer_ptr(), buffer_ptr);
        assert_eq!(reused.state(), ConnectionState::Closed);
        assert_eq!(reused.load(), 0);
    }

    #[test]
    fn disabled_pool_drops_checked_in_connections() {
        let mut pool = ConnectionPool::new(false, 100, 64, 64, true);
        assert_eq!(pool.idle_count(), 0);
        let mut conn = pool.checkout();
        conn.force_close(&Status::connector_error_communication("bye"));
        pool.checkin(conn);
        assert_eq!(pool.idle_count(), 0);
    }
}
