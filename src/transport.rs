//! Transport abstraction for the DLMS session client.
//!
//! Keeps [`crate::session`] agnostic of the underlying byte pipe (TCP today; a
//! serial transport would implement the same trait).

use std::time::Duration;

pub mod tcp;

/// A blocking, single-caller byte transport.
///
/// Implementations are not required to be `Sync`: the DLMS session owns its
/// transport exclusively and is never shared across threads.
pub trait Transport: std::fmt::Debug {
    type Error: std::error::Error + 'static;

    /// Sends the given bytes, blocking until the whole buffer has been written.
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Reads at least one byte into `buffer`, blocking until data arrives or the
    /// transport's own timeout (if any) elapses. Returns the number of bytes read.
    fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Like [`Transport::recv`] but with an explicit timeout overriding whatever
    /// default the transport was configured with.
    fn recv_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;

    /// Non-blocking peek at pending bytes without consuming them. Used for the
    /// buffer-hygiene heuristic: a large backlog after a reconnect usually means
    /// stale bytes from the meter's previous HDLC session.
    fn peek_pending(&mut self) -> Result<usize, Self::Error>;

    /// Discards up to `max_bytes` of pending input without blocking. Returns the
    /// number of bytes actually discarded.
    fn drain(&mut self, max_bytes: usize) -> Result<usize, Self::Error>;

    /// Forces an abortive close (TCP RST, where the underlying transport is a
    /// socket) so the peer drops any lingering HDLC/association state rather
    /// than waiting out a FIN. Transports with no such concept (in-memory
    /// mocks, anything already torn down by a DISC exchange) are a no-op.
    fn reset(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
