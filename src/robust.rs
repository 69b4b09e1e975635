//! Self-healing wrapper around [`Session`]/[`RegisterReader`]: connection
//! state machine, retrying connect policy, and forced-reconnect reads (§4.4).

use std::fmt;
use std::thread;
use std::time::Duration;

use crate::register::RegisterReader;
use crate::session::{Session, SessionConfig, SessionError};
use crate::transport::Transport;
use crate::unit::Unit;
use crate::obis::ObisCode;

/// Produces a fresh transport for each (re)connect attempt. A real deployment
/// hands this a TCP dialer; tests hand it a scripted in-memory transport.
pub trait TransportConnector {
    type Transport: Transport;
    type Error: std::error::Error + 'static;

    fn connect(&self) -> Result<Self::Transport, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Pause observed only before the very first connect attempt, giving the
    /// meter time to settle after a cold power-up.
    pub settle_pause: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            settle_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub enum RobustError {
    NotConnected,
    ConnectExhausted(String),
    Session(SessionError),
}

impl fmt::Display for RobustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobustError::NotConnected => write!(f, "not connected and auto-connect failed"),
            RobustError::ConnectExhausted(msg) => write!(f, "exhausted connect attempts: {msg}"),
            RobustError::Session(e) => write!(f, "session error: {e}"),
        }
    }
}

impl std::error::Error for RobustError {}

impl From<SessionError> for RobustError {
    fn from(e: SessionError) -> Self {
        RobustError::Session(e)
    }
}

/// A read error classified as transient, per the taxonomy in §7: worth a
/// forced reconnect rather than giving up immediately.
fn is_transient(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::Timeout
            | SessionError::ConnectionClosed
            | SessionError::SequenceMismatch { .. }
            | SessionError::InvokeIdMismatch { .. }
            | SessionError::Hdlc(_)
    )
}

pub struct RobustClient<C: TransportConnector> {
    connector: C,
    session_config: SessionConfig,
    policy: ConnectPolicy,
    state: ConnectionState,
    last_error: Option<String>,
    reader: Option<RegisterReader<C::Transport>>,
    has_connected_once: bool,
}

impl<C: TransportConnector> RobustClient<C> {
    pub fn new(connector: C, session_config: SessionConfig, policy: ConnectPolicy) -> Self {
        Self {
            connector,
            session_config,
            policy,
            state: ConnectionState::Disconnected,
            last_error: None,
            reader: None,
            has_connected_once: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn reader_mut(&mut self) -> Option<&mut RegisterReader<C::Transport>> {
        self.reader.as_mut()
    }

    /// Connects (or reconnects, if `force` and already connected). Before
    /// each attempt, drops any existing socket so the meter's prior HDLC
    /// association is torn down by the peer's own RST handling; N(S)/N(R)/
    /// invoke-id are implicitly zeroed because a fresh [`Session`] is built.
    pub fn connect(&mut self, force: bool) -> Result<(), RobustError> {
        if self.is_connected() && !force {
            return Ok(());
        }
        if force {
            self.disconnect();
        }

        if !self.has_connected_once {
            thread::sleep(self.policy.settle_pause);
        }

        self.state = ConnectionState::Connecting;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_connect_once() {
                Ok(reader) => {
                    self.reader = Some(reader);
                    self.state = ConnectionState::Connected;
                    self.last_error = None;
                    self.has_connected_once = true;
                    return Ok(());
                }
                Err(message) => {
                    self.last_error = Some(message.clone());
                    if attempt >= self.policy.max_attempts {
                        self.state = ConnectionState::Error;
                        return Err(RobustError::ConnectExhausted(message));
                    }
                    thread::sleep(self.policy.base_delay * attempt);
                }
            }
        }
    }

    fn try_connect_once(&self) -> Result<RegisterReader<C::Transport>, String> {
        let transport = self.connector.connect().map_err(|e| e.to_string())?;
        let mut session = Session::new(transport, &self.session_config);
        session.associate(&self.session_config.password).map_err(|e| e.to_string())?;
        Ok(RegisterReader::new(session))
    }

    /// Drops the session: DISC first (best-effort), then a forced RST so the
    /// meter cannot hold the prior HDLC association open across a reconnect.
    /// Both steps swallow their own errors; this is a best-effort teardown.
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            let mut session = reader.into_session();
            session.release();
            let _ = session.transport_mut().reset();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Reads `obis` through the cache, applying one level of forced-reconnect
    /// retry on a transient error.
    pub fn read_register(&mut self, obis: ObisCode, retries: u32) -> Result<(f64, Unit, i64), RobustError> {
        if !self.is_connected() {
            self.connect(false)?;
        }

        let mut attempt = 0;
        loop {
            let result = match self.reader.as_mut() {
                Some(reader) => reader.read_optimized(obis),
                None => return Err(RobustError::NotConnected),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if attempt < retries && is_transient(&error) => {
                    attempt += 1;
                    self.state = ConnectionState::Error;
                    self.connect(true)?;
                }
                Err(error) => {
                    self.state = ConnectionState::Error;
                    return Err(RobustError::Session(error));
                }
            }
        }
    }

    pub fn warmup_cache(&mut self, obis_codes: &[ObisCode]) -> Result<(), RobustError> {
        if !self.is_connected() {
            self.connect(false)?;
        }
        match self.reader.as_mut() {
            Some(reader) => {
                reader.warmup_cache(obis_codes);
                Ok(())
            }
            None => Err(RobustError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdlc::{self, ControlField};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Debug)]
    struct ScriptedTransport {
        debris: VecDeque<u8>,
        inbound: VecDeque<u8>,
        reset_count: Rc<RefCell<u32>>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MockError(&'static str);
    impl fmt::Display for MockError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for MockError {}

    impl Transport for ScriptedTransport {
        type Error = MockError;
        fn send(&mut self, _data: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
            let mut n = 0;
            while n < buffer.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buffer[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
        fn recv_timeout(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, Self::Error> {
            self.recv(buffer)
        }
        fn peek_pending(&mut self) -> Result<usize, Self::Error> {
            Ok(self.debris.len() + self.inbound.len())
        }
        fn drain(&mut self, max_bytes: usize) -> Result<usize, Self::Error> {
            let n = max_bytes.min(self.debris.len());
            self.debris.drain(..n);
            Ok(n)
        }
        fn reset(&mut self) -> Result<(), Self::Error> {
            *self.reset_count.borrow_mut() += 1;
            Ok(())
        }
    }

    fn handshake_bytes() -> Vec<u8> {
        let server = hdlc::server_address(1, 1);
        let mut bytes = hdlc::encode_frame(hdlc::CONTROL_UA, 0x10, server, &[]);
        let mut aare_info = vec![0x61, 0x05];
        aare_info.extend([0xA2, 0x03, 0x02, 0x01, 0x00]);
        bytes.extend(hdlc::encode_frame(ControlField::information(0, 1, true), 0x10, server, &aare_info));
        bytes
    }

    /// Connector whose first N `connect()` calls fail, then succeeds with a
    /// working handshake script. Every transport it hands out shares one
    /// `reset_count` so a test can observe RST teardown across reconnects.
    struct FlakyConnector {
        failures_remaining: RefCell<u32>,
        reset_count: Rc<RefCell<u32>>,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> Self {
            Self { failures_remaining: RefCell::new(failures), reset_count: Rc::new(RefCell::new(0)) }
        }
    }

    impl TransportConnector for FlakyConnector {
        type Transport = ScriptedTransport;
        type Error = MockError;

        fn connect(&self) -> Result<Self::Transport, Self::Error> {
            let mut remaining = self.failures_remaining.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MockError("connection refused"));
            }
            let mut inbound = VecDeque::new();
            inbound.extend(handshake_bytes());
            Ok(ScriptedTransport { debris: VecDeque::new(), inbound, reset_count: Rc::clone(&self.reset_count) })
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            client_address: 0x10,
            server_logical: 1,
            server_physical: 1,
            password: b"22222222".to_vec(),
            max_info_length: None,
            read_timeout: Duration::from_millis(50),
        }
    }

    fn fast_policy() -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            settle_pause: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_connect_succeeds_first_try() {
        let connector = FlakyConnector::new(0);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.connect(false).unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_retries_then_succeeds() {
        let connector = FlakyConnector::new(2);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        client.connect(false).unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_exhausts_attempts() {
        let connector = FlakyConnector::new(10);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        let err = client.connect(false).unwrap_err();
        assert!(matches!(err, RobustError::ConnectExhausted(_)));
        assert_eq!(client.state(), ConnectionState::Error);
        assert!(client.last_error().is_some());
    }

    #[test]
    fn test_connect_is_idempotent_when_already_connected() {
        let connector = FlakyConnector::new(0);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        client.connect(false).unwrap();
        client.connect(false).unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_returns_to_disconnected() {
        let connector = FlakyConnector::new(0);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        client.connect(false).unwrap();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.reader_mut().is_none());
    }

    #[test]
    fn test_disconnect_forces_transport_reset() {
        let connector = FlakyConnector::new(0);
        let reset_count = Rc::clone(&connector.reset_count);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        client.connect(false).unwrap();
        assert_eq!(*reset_count.borrow(), 0);
        client.disconnect();
        assert_eq!(*reset_count.borrow(), 1);
    }

    #[test]
    fn test_forced_reconnect_resets_prior_transport() {
        let connector = FlakyConnector::new(0);
        let reset_count = Rc::clone(&connector.reset_count);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        client.connect(false).unwrap();
        client.connect(true).unwrap();
        assert_eq!(*reset_count.borrow(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_read_register_not_connected_auto_connects() {
        let connector = FlakyConnector::new(0);
        let mut client = RobustClient::new(connector, session_config(), fast_policy());
        // No GET response queued beyond the handshake; the read itself will
        // fail, but auto-connect must have happened first.
        let _ = client.read_register("1-1:1.8.0".parse().unwrap(), 0);
        assert_ne!(client.state(), ConnectionState::Disconnected);
    }
}
