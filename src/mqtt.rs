//! MQTT telemetry/attributes publisher with an offline FIFO buffer (§4.6).
//!
//! Wraps `rumqttc`'s synchronous client: a background thread drives the
//! event loop (acking publishes, observing CONNACK/disconnects, and letting
//! `rumqttc` perform its own transport-level reconnection), while the
//! offline buffer absorbs publishes attempted while disconnected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::{Map, Value};

pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";

const DEFAULT_MAX_OFFLINE_MESSAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherStats {
    pub connected: bool,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_buffered: u64,
    pub reconnect_count: u64,
}

struct OfflineBuffer {
    messages: VecDeque<(String, Vec<u8>)>,
    capacity: usize,
}

impl OfflineBuffer {
    fn new(capacity: usize) -> Self {
        Self { messages: VecDeque::with_capacity(capacity.min(64)), capacity }
    }

    /// Drops the oldest entry on overflow, per the offline buffer's
    /// documented drop-oldest policy.
    fn push(&mut self, topic: String, payload: Vec<u8>) -> bool {
        let overflowed = self.messages.len() >= self.capacity;
        if overflowed {
            self.messages.pop_front();
        }
        self.messages.push_back((topic, payload));
        overflowed
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

/// The publishing surface a [`crate::worker::Worker`] depends on, kept
/// separate from the concrete `rumqttc`-backed client so tests can supply an
/// in-process double instead of dialing a real broker.
pub trait Publisher {
    fn is_connected(&self) -> bool;
    fn publish_telemetry<T: Serialize>(&self, values: &T, timestamp_ms: Option<i64>) -> bool;
    fn publish_attributes<T: Serialize>(&self, attributes: &T) -> bool;
    fn stats(&self) -> PublisherStats;
}

/// A ThingsBoard-shaped MQTT client: device access token as username,
/// clean-session, QoS 1 publishes, with transparent offline buffering.
pub struct MqttPublisher {
    client: Client,
    connected: Arc<AtomicBool>,
    buffer: Arc<Mutex<OfflineBuffer>>,
    messages_sent: Arc<AtomicU64>,
    messages_failed: Arc<AtomicU64>,
    reconnect_count: Arc<AtomicU64>,
    last_publish_time: Arc<Mutex<Option<Instant>>>,
    _event_thread: JoinHandle<()>,
}

impl MqttPublisher {
    /// Connects with a device access token as the MQTT username (ThingsBoard
    /// convention), blocking until CONNACK or `timeout` elapses.
    pub fn connect(
        host: &str,
        port: u16,
        client_id: &str,
        access_token: &str,
        timeout: Duration,
        keepalive: Duration,
        max_offline_messages: Option<usize>,
    ) -> Result<Self, MqttError> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keepalive);
        options.set_clean_session(true);
        if !access_token.is_empty() {
            options.set_credentials(access_token, "");
        }

        let (client, connection) = Client::new(options, 64);

        let connected = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(Mutex::new(OfflineBuffer::new(max_offline_messages.unwrap_or(DEFAULT_MAX_OFFLINE_MESSAGES))));
        let messages_sent = Arc::new(AtomicU64::new(0));
        let messages_failed = Arc::new(AtomicU64::new(0));
        let reconnect_count = Arc::new(AtomicU64::new(0));
        let last_publish_time = Arc::new(Mutex::new(None));
        let connect_error = Arc::new(Mutex::new(None));

        let event_client = client.clone();
        let event_connected = Arc::clone(&connected);
        let event_buffer = Arc::clone(&buffer);
        let event_sent = Arc::clone(&messages_sent);
        let event_reconnects = Arc::clone(&reconnect_count);
        let event_last_publish = Arc::clone(&last_publish_time);
        let event_connect_error = Arc::clone(&connect_error);

        let event_thread = thread::spawn(move || {
            drive_event_loop(
                connection,
                event_client,
                event_connected,
                event_buffer,
                event_sent,
                event_reconnects,
                event_last_publish,
                event_connect_error,
            );
        });

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if connected.load(Ordering::SeqCst) {
                return Ok(Self {
                    client,
                    connected,
                    buffer,
                    messages_sent,
                    messages_failed,
                    reconnect_count,
                    last_publish_time,
                    _event_thread: event_thread,
                });
            }
            if let Some(reason) = connect_error.lock().unwrap().take() {
                let _ = client.disconnect();
                let _ = event_thread.join();
                return Err(MqttError::ConnectRejected(reason));
            }
            thread::sleep(Duration::from_millis(20));
        }

        let _ = client.disconnect();
        let _ = event_thread.join();
        Err(MqttError::Timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publishes `{"ts": <ms>, "values": {...}}` to the telemetry topic at
    /// QoS 1. Returns `true` iff handed to the client or enqueued offline.
    pub fn publish_telemetry<T: Serialize>(&self, values: &T, timestamp_ms: Option<i64>) -> bool {
        let mut object = Map::new();
        object.insert("ts".to_string(), Value::from(timestamp_ms.unwrap_or_else(now_millis)));
        let values_json = match serde_json::to_value(values) {
            Ok(v) => v,
            Err(_) => return false,
        };
        object.insert("values".to_string(), values_json);
        self.publish(TELEMETRY_TOPIC, &Value::Object(object))
    }

    /// Publishes a flat attributes object (no timestamp wrapper) at QoS 1.
    pub fn publish_attributes<T: Serialize>(&self, attributes: &T) -> bool {
        let value = match serde_json::to_value(attributes) {
            Ok(v) => v,
            Err(_) => return false,
        };
        self.publish(ATTRIBUTES_TOPIC, &value)
    }

    fn publish(&self, topic: &str, payload: &Value) -> bool {
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(_) => {
                self.messages_failed.fetch_add(1, Ordering::SeqCst);
                return false;
            }
        };

        if self.is_connected() {
            match self.client.publish(topic, QoS::AtLeastOnce, false, bytes.clone()) {
                Ok(()) => {
                    self.messages_sent.fetch_add(1, Ordering::SeqCst);
                    *self.last_publish_time.lock().unwrap() = Some(Instant::now());
                    return true;
                }
                Err(_) => {
                    // Fall through to offline buffering below.
                }
            }
        }

        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(topic.to_string(), bytes);
        true
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            connected: self.is_connected(),
            messages_sent: self.messages_sent.load(Ordering::SeqCst),
            messages_failed: self.messages_failed.load(Ordering::SeqCst),
            messages_buffered: self.buffer.lock().unwrap().len() as u64,
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
        }
    }

    pub fn disconnect(self) {
        let _ = self.client.disconnect();
    }
}

impl Publisher for MqttPublisher {
    fn is_connected(&self) -> bool {
        MqttPublisher::is_connected(self)
    }

    fn publish_telemetry<T: Serialize>(&self, values: &T, timestamp_ms: Option<i64>) -> bool {
        MqttPublisher::publish_telemetry(self, values, timestamp_ms)
    }

    fn publish_attributes<T: Serialize>(&self, attributes: &T) -> bool {
        MqttPublisher::publish_attributes(self, attributes)
    }

    fn stats(&self) -> PublisherStats {
        MqttPublisher::stats(self)
    }
}

/// Accepts and discards everything, used when a meter's `publisher.enabled`
/// flag is off but the worker still needs a concrete [`Publisher`] to poll
/// against.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn is_connected(&self) -> bool {
        true
    }
    fn publish_telemetry<T: Serialize>(&self, _values: &T, _timestamp_ms: Option<i64>) -> bool {
        true
    }
    fn publish_attributes<T: Serialize>(&self, _attributes: &T) -> bool {
        true
    }
    fn stats(&self) -> PublisherStats {
        PublisherStats { connected: true, messages_sent: 0, messages_failed: 0, messages_buffered: 0, reconnect_count: 0 }
    }
}

/// Chooses between a live MQTT connection and the no-op sink at worker
/// construction time, so callers only need one concrete `Publisher` type
/// regardless of each meter's `publisher.enabled` flag.
pub enum EitherPublisher {
    Mqtt(MqttPublisher),
    Null(NullPublisher),
}

impl Publisher for EitherPublisher {
    fn is_connected(&self) -> bool {
        match self {
            EitherPublisher::Mqtt(p) => p.is_connected(),
            EitherPublisher::Null(p) => p.is_connected(),
        }
    }

    fn publish_telemetry<T: Serialize>(&self, values: &T, timestamp_ms: Option<i64>) -> bool {
        match self {
            EitherPublisher::Mqtt(p) => p.publish_telemetry(values, timestamp_ms),
            EitherPublisher::Null(p) => p.publish_telemetry(values, timestamp_ms),
        }
    }

    fn publish_attributes<T: Serialize>(&self, attributes: &T) -> bool {
        match self {
            EitherPublisher::Mqtt(p) => p.publish_attributes(attributes),
            EitherPublisher::Null(p) => p.publish_attributes(attributes),
        }
    }

    fn stats(&self) -> PublisherStats {
        match self {
            EitherPublisher::Mqtt(p) => p.stats(),
            EitherPublisher::Null(p) => p.stats(),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drives the `rumqttc` event loop for the publisher's lifetime: tracks
/// CONNACK/disconnect transitions and flushes the offline buffer in FIFO
/// order on reconnect, restoring a message to the head of the queue and
/// breaking the flush loop the moment a publish is rejected.
fn drive_event_loop(
    mut connection: rumqttc::Connection,
    client: Client,
    connected: Arc<AtomicBool>,
    buffer: Arc<Mutex<OfflineBuffer>>,
    messages_sent: Arc<AtomicU64>,
    reconnect_count: Arc<AtomicU64>,
    last_publish_time: Arc<Mutex<Option<Instant>>>,
    connect_error: Arc<Mutex<Option<String>>>,
) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let accepted = ack.code == rumqttc::ConnectReturnCode::Success;
                let was_connected = connected.swap(accepted, Ordering::SeqCst);
                if !was_connected && accepted {
                    flush_offline_buffer(&client, &buffer, &messages_sent, &last_publish_time);
                } else if !accepted {
                    *connect_error.lock().unwrap() = Some(format!("{:?}", ack.code));
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if connected.swap(false, Ordering::SeqCst) {
                    reconnect_count.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(_) => {}
            Err(_) => {
                if connected.swap(false, Ordering::SeqCst) {
                    reconnect_count.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

fn flush_offline_buffer(
    client: &Client,
    buffer: &Arc<Mutex<OfflineBuffer>>,
    messages_sent: &Arc<AtomicU64>,
    last_publish_time: &Arc<Mutex<Option<Instant>>>,
) {
    loop {
        let next = {
            let mut buffer = buffer.lock().unwrap();
            buffer.messages.pop_front()
        };
        let Some((topic, payload)) = next else { break };

        match client.publish(&topic, QoS::AtLeastOnce, false, payload.clone()) {
            Ok(()) => {
                messages_sent.fetch_add(1, Ordering::SeqCst);
                *last_publish_time.lock().unwrap() = Some(Instant::now());
            }
            Err(_) => {
                buffer.lock().unwrap().messages.push_front((topic, payload));
                break;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    Timeout,
    ConnectRejected(String),
    Connection(String),
}

impl std::fmt::Display for MqttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttError::Timeout => write!(f, "timed out waiting for CONNACK"),
            MqttError::ConnectRejected(code) => write!(f, "broker rejected connection: {code}"),
            MqttError::Connection(msg) => write!(f, "MQTT connection error: {msg}"),
        }
    }
}

impl std::error::Error for MqttError {}
