//! DLMS session client: owns the transport and drives the
//! SNRM → UA → AARQ → AARE → GET dialogue (§4.2).

use std::fmt;
use std::time::Duration;

use crate::association::{self, AssociationError};
use crate::data::{Data, DataError};
use crate::hdlc::{self, ControlField, HdlcError};
use crate::obis::ObisCode;
use crate::transport::Transport;
use crate::unit::{ScalerUnit, Unit};

const REGISTER_CLASS_ID: u16 = 3;
const REGISTER_VALUE_ATTRIBUTE: u8 = 2;
const REGISTER_SCALER_UNIT_ATTRIBUTE: u8 = 3;

pub struct SessionConfig {
    pub client_address: u32,
    pub server_logical: u16,
    pub server_physical: u16,
    pub password: Vec<u8>,
    /// HDLC max-info-field-length negotiated in SNRM; `None` sends an empty
    /// SNRM info field and lets the meter pick its own defaults.
    pub max_info_length: Option<u16>,
    pub read_timeout: Duration,
}

/// Builds the SNRM parameter block: max-info-field-length TX/RX and window
/// sizes TX/RX, both fixed at 1 (no multi-frame windowing).
fn encode_snrm_parameters(max_info_tx: u16, max_info_rx: u16) -> Vec<u8> {
    let mut params = Vec::with_capacity(20);
    params.extend([0x05, 0x02]);
    params.extend(max_info_tx.to_be_bytes());
    params.extend([0x06, 0x02]);
    params.extend(max_info_rx.to_be_bytes());
    params.extend([0x07, 0x04, 0x00, 0x00, 0x00, 0x01]);
    params.extend([0x08, 0x04, 0x00, 0x00, 0x00, 0x01]);

    let mut info = vec![0x81, 0x80, params.len() as u8];
    info.extend(params);
    info
}

impl SessionConfig {
    pub fn server_address(&self) -> u32 {
        hdlc::server_address(self.server_logical, self.server_physical)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Timeout,
    ConnectionClosed,
    BadHandshake,
    AssociationRejected(u8),
    SequenceMismatch { expected: u8, actual: u8 },
    InvokeIdMismatch { expected: u8, actual: u8 },
    GetError(u8),
    UnsupportedDataType(u8),
    MalformedGetResponse,
    Transport(String),
    Hdlc(HdlcError),
    Association(AssociationError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Timeout => write!(f, "timed out waiting for a response"),
            SessionError::ConnectionClosed => write!(f, "peer closed the connection"),
            SessionError::BadHandshake => write!(f, "unexpected response during SNRM/UA handshake"),
            SessionError::AssociationRejected(code) => write!(f, "association rejected with result 0x{code:02X}"),
            SessionError::SequenceMismatch { expected, actual } => {
                write!(f, "expected N(R)={expected}, got {actual}")
            }
            SessionError::InvokeIdMismatch { expected, actual } => {
                write!(f, "expected invoke-id {expected}, got {actual}")
            }
            SessionError::GetError(code) => write!(f, "GET.response returned error code 0x{code:02X}"),
            SessionError::UnsupportedDataType(tag) => write!(f, "unsupported DLMS data type tag 0x{tag:02X}"),
            SessionError::MalformedGetResponse => write!(f, "malformed GET.response APDU"),
            SessionError::Transport(msg) => write!(f, "transport error: {msg}"),
            SessionError::Hdlc(e) => write!(f, "HDLC error: {e}"),
            SessionError::Association(e) => write!(f, "association error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<HdlcError> for SessionError {
    fn from(e: HdlcError) -> Self {
        SessionError::Hdlc(e)
    }
}

impl From<AssociationError> for SessionError {
    fn from(e: AssociationError) -> Self {
        SessionError::Association(e)
    }
}

impl From<DataError> for SessionError {
    fn from(e: DataError) -> Self {
        match e {
            DataError::UnsupportedDataType(tag) => SessionError::UnsupportedDataType(tag),
            DataError::Truncated | DataError::UnexpectedType => SessionError::MalformedGetResponse,
        }
    }
}

impl SessionError {
    /// True for errors that indicate the HDLC frame itself was malformed or
    /// miscounted, the watchdog's `hdlc` category (§4.5).
    pub fn is_hdlc_category(&self) -> bool {
        match self {
            SessionError::Hdlc(e) => e.is_hdlc_category(),
            SessionError::SequenceMismatch { .. } | SessionError::InvokeIdMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Drives one DLMS application association over a [`Transport`].
pub struct Session<T: Transport> {
    transport: T,
    server_address: u32,
    client_address: u32,
    max_info_length: Option<u16>,
    read_timeout: Duration,
    send_seq: u8,
    recv_seq: u8,
    invoke_id: u8,
    established: bool,
    rx_buffer: Vec<u8>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: &SessionConfig) -> Self {
        Self {
            transport,
            server_address: config.server_address(),
            client_address: config.client_address,
            max_info_length: config.max_info_length,
            read_timeout: config.read_timeout,
            send_seq: 0,
            recv_seq: 0,
            invoke_id: 1,
            established: false,
            rx_buffer: Vec::new(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Discards any bytes the meter sent before this handshake began (stale
    /// debris from a previous, improperly closed session).
    pub fn drain_stale_input(&mut self) {
        self.rx_buffer.clear();
        let _ = self.transport.drain(4096);
    }

    fn send_frame(&mut self, control: u8, info: &[u8]) -> Result<(), SessionError> {
        let frame = hdlc::encode_frame(control, self.server_address, self.client_address, info);
        self.transport.send(&frame).map_err(|e| SessionError::Transport(e.to_string()))
    }

    fn read_frame(&mut self) -> Result<hdlc::HdlcFrame, SessionError> {
        loop {
            if let Some((start, end)) = hdlc::find_frame(&self.rx_buffer) {
                let raw: Vec<u8> = self.rx_buffer[start..end].to_vec();
                self.rx_buffer.drain(..end);
                return Ok(hdlc::decode_frame(&raw)?);
            }

            let mut chunk = [0u8; 512];
            let n = self
                .transport
                .recv_timeout(&mut chunk, self.read_timeout)
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(SessionError::ConnectionClosed);
            }
            self.rx_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn i_control(&self, poll_final: bool) -> u8 {
        ControlField::information(self.send_seq, self.recv_seq, poll_final)
    }

    fn next_invoke_id(&mut self) -> u8 {
        let id = self.invoke_id;
        self.invoke_id = self.invoke_id.wrapping_add(1);
        if self.invoke_id == 0 {
            self.invoke_id = 1;
        }
        id
    }

    /// Sends `info` as an I-frame, advances N(S), and returns the validated
    /// I-frame response, updating N(R) from the peer's N(S).
    fn exchange_i_frame(&mut self, info: &[u8]) -> Result<hdlc::HdlcFrame, SessionError> {
        let control = self.i_control(true);
        self.send_frame(control, info)?;
        self.send_seq = (self.send_seq + 1) % 8;

        let frame = self.read_frame()?;
        match ControlField::classify(frame.control) {
            ControlField::Information { send_seq, recv_seq, .. } => {
                if recv_seq != self.send_seq {
                    return Err(SessionError::SequenceMismatch {
                        expected: self.send_seq,
                        actual: recv_seq,
                    });
                }
                self.recv_seq = send_seq;
                Ok(frame)
            }
            _ => Err(SessionError::BadHandshake),
        }
    }

    /// Drives SNRM → UA then AARQ → AARE. Resets sequence/invoke-id state
    /// first so a retried handshake starts clean, and drains any bytes the
    /// meter sent before this handshake began before sending SNRM.
    pub fn associate(&mut self, password: &[u8]) -> Result<(), SessionError> {
        self.send_seq = 0;
        self.recv_seq = 0;
        self.invoke_id = 1;
        self.established = false;
        self.drain_stale_input();

        let snrm_info = match self.max_info_length {
            Some(max_len) => encode_snrm_parameters(max_len, max_len),
            None => Vec::new(),
        };
        self.send_frame(hdlc::CONTROL_SNRM, &snrm_info)?;
        let ua = self.read_frame()?;
        match ControlField::classify(ua.control) {
            ControlField::Unnumbered { raw, .. } if raw == hdlc::CONTROL_UA => {}
            _ => return Err(SessionError::BadHandshake),
        }

        let aarq = association::build_aarq(password)?;
        let response = self.exchange_i_frame(&aarq)?;
        let result = association::parse_aare(&response.info)?;
        if result != association::ASSOCIATION_RESULT_ACCEPTED {
            return Err(SessionError::AssociationRejected(result));
        }

        self.established = true;
        Ok(())
    }

    /// Sends DISC and waits briefly for UA; failures are not surfaced, matching
    /// the best-effort teardown a caller performs before closing the socket.
    pub fn release(&mut self) {
        let _ = self.send_frame(hdlc::CONTROL_DISC, &[]);
        let _ = self.read_frame();
        self.established = false;
    }

    /// GET.request for one attribute of a COSEM object, returning the decoded
    /// value attribute payload.
    pub fn get_attribute(&mut self, class_id: u16, obis: ObisCode, attribute_id: u8) -> Result<Data, SessionError> {
        let invoke_id = self.next_invoke_id();
        let mut apdu = vec![0xE6, 0xE6, 0x00, 0xC0, 0x01, invoke_id];
        apdu.extend((class_id).to_be_bytes());
        apdu.extend(obis.encode());
        apdu.push(attribute_id);
        apdu.push(0x00); // no selective access

        let response = self.exchange_i_frame(&apdu)?;
        let info = &response.info;
        if info.len() < 7 || info[0..3] != [0xE6, 0xE7, 0x00] || info[3] != 0xC4 || info[4] != 0x01 {
            return Err(SessionError::MalformedGetResponse);
        }
        if info[5] != invoke_id {
            return Err(SessionError::InvokeIdMismatch { expected: invoke_id, actual: info[5] });
        }
        let result = info[6];
        if result != 0x00 {
            return Err(SessionError::GetError(result));
        }

        let (data, _consumed) = Data::decode(&info[7..])?;
        Ok(data)
    }

    /// Reads a Register's scaler/unit (attribute 3) then its value (attribute
    /// 2), returning `(scaled_value, unit, raw_value)`. Non-numeric values
    /// cannot be scaled and are reported as [`SessionError::MalformedGetResponse`].
    pub fn read_register(&mut self, obis: ObisCode) -> Result<(f64, Unit, i64), SessionError> {
        let scaler_data = self.get_attribute(REGISTER_CLASS_ID, obis, REGISTER_SCALER_UNIT_ATTRIBUTE)?;
        let scaler_unit = ScalerUnit::from_data(&scaler_data)?;

        let value_data = self.get_attribute(REGISTER_CLASS_ID, obis, REGISTER_VALUE_ATTRIBUTE)?;
        let raw = value_data.as_i64().ok_or(SessionError::MalformedGetResponse)?;

        let scaled = raw as f64 * 10f64.powi(scaler_unit.scaler as i32);
        Ok((scaled, scaler_unit.unit, raw))
    }
}
