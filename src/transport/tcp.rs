//! Blocking TCP transport for DLMS/COSEM communication.
//!
//! See the parent module [`crate::transport`] for the [`Transport`] trait this
//! implements.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::robust::TransportConnector;
use crate::transport::Transport;

/// Default TCP port for DLMS/COSEM communication (IEC 62056-47).
pub const DEFAULT_DLMS_TCP_PORT: u16 = 4059;

/// Default read timeout for TCP connections.
pub const DEFAULT_TCP_READ_TIMEOUT: Duration = Duration::from_secs(7);

/// Default write timeout for TCP connections.
pub const DEFAULT_TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(7);

/// Bytes pending on the socket beyond this threshold trigger the buffer-hygiene
/// drain heuristic (decision recorded in DESIGN.md, open question 3).
pub const DRAIN_HEURISTIC_THRESHOLD: usize = 100;

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::connect_timeout_impl(addr, DEFAULT_TCP_READ_TIMEOUT)
    }

    pub fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        Self::connect_timeout_impl(addr, timeout)
    }

    fn connect_timeout_impl<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(DEFAULT_TCP_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(DEFAULT_TCP_WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Shuts the connection down, forcing a TCP RST by setting `SO_LINGER` with
    /// linger-on and a zero timeout first. Used by the robust client to clear a
    /// meter's lingering HDLC session state before reconnecting.
    pub fn shutdown_with_reset(&self) -> io::Result<()> {
        self.stream.set_linger(Some(Duration::from_secs(0)))?;
        self.stream.shutdown(Shutdown::Both)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }
}

impl Transport for TcpTransport {
    type Error = io::Error;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        self.stream.read(buffer)
    }

    fn recv_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        let original = self.stream.read_timeout()?;
        self.stream.set_read_timeout(Some(timeout))?;
        let result = self.stream.read(buffer);
        if let Err(restore_err) = self.stream.set_read_timeout(original) {
            if result.is_ok() {
                return Err(restore_err);
            }
        }
        result
    }

    fn peek_pending(&mut self) -> Result<usize, Self::Error> {
        let mut probe = [0u8; 512];
        let original = self.stream.read_timeout()?;
        self.stream.set_read_timeout(Some(Duration::from_millis(50)))?;
        let result = match self.stream.peek(&mut probe) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        };
        self.stream.set_read_timeout(original)?;
        result
    }

    fn drain(&mut self, max_bytes: usize) -> Result<usize, Self::Error> {
        let mut discarded = 0;
        let mut buf = [0u8; 256];
        let original = self.stream.read_timeout()?;
        self.stream.set_read_timeout(Some(Duration::from_millis(50)))?;
        while discarded < max_bytes {
            let chunk = (max_bytes - discarded).min(buf.len());
            match self.stream.read(&mut buf[..chunk]) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => {
                    self.stream.set_read_timeout(original)?;
                    return Err(e);
                }
            }
        }
        self.stream.set_read_timeout(original)?;
        Ok(discarded)
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.shutdown_with_reset()
    }
}

/// Produces a fresh [`TcpTransport`] for each (re)connect attempt against one
/// meter's host:port, the production counterpart of the in-memory connectors
/// used in tests throughout this crate.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl TransportConnector for TcpConnector {
    type Transport = TcpTransport;
    type Error = io::Error;

    fn connect(&self) -> Result<Self::Transport, Self::Error> {
        TcpTransport::connect_timeout((self.host.as_str(), self.port), self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_DLMS_TCP_PORT, 4059);
        assert_eq!(DRAIN_HEURISTIC_THRESHOLD, 100);
    }

    #[test]
    fn test_connect_and_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut transport = TcpTransport::connect(addr).unwrap();
        transport.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = transport.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.join().unwrap();
    }

    #[test]
    fn test_connector_dials_configured_host_and_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });

        let connector = TcpConnector { host: addr.ip().to_string(), port: addr.port(), connect_timeout: Duration::from_secs(2) };
        assert!(connector.connect().is_ok());
        server.join().unwrap();
    }

    #[test]
    fn test_peek_pending_on_idle_socket_is_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut transport = TcpTransport::connect(addr).unwrap();
        assert_eq!(transport.peek_pending().unwrap(), 0);
        server.join().unwrap();
    }
}
