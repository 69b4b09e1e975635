//! Per-meter duty cycle: the watchdog, circuit breaker, and lifecycle-
//! controlled reconnection described in §4.5. This is the hard part: it ties
//! the register reader, the robust client, and the publisher together into
//! one long-running, self-healing loop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use crate::config::{ConnectConfig, MeterConfig, WatchdogConfig};
use crate::diagnostics::{Category, DiagnosticEvent, Severity};
use crate::mqtt::Publisher;
use crate::obis::ObisCode;
use crate::robust::{ConnectPolicy, RobustClient, RobustError, TransportConnector};
use crate::transport::tcp::DRAIN_HEURISTIC_THRESHOLD;
use crate::transport::Transport;

/// Tunables governing the watchdog and preventive maintenance, converted
/// once from [`WatchdogConfig`]'s minute/second fields into [`Duration`]s so
/// the worker loop never re-derives them.
#[derive(Debug, Clone)]
pub struct WorkerThresholds {
    pub max_consecutive_hdlc_errors: u32,
    pub max_consecutive_read_failures: u32,
    pub max_silence: Duration,
    pub connection_max_age: Duration,
    pub max_reconnects_per_hour: u32,
    pub circuit_breaker_pause: Duration,
    pub preventive_drain_interval: Duration,
    pub heartbeat_every_cycles: u64,
    pub reconnect_settle_pause: Duration,
    pub breaker_denied_pause: Duration,
}

impl From<&WatchdogConfig> for WorkerThresholds {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            max_consecutive_hdlc_errors: config.max_consecutive_hdlc_errors,
            max_consecutive_read_failures: config.max_consecutive_read_failures,
            max_silence: Duration::from_secs(config.max_silence_minutes * 60),
            connection_max_age: Duration::from_secs(config.connection_max_age_minutes * 60),
            max_reconnects_per_hour: config.max_reconnects_per_hour,
            circuit_breaker_pause: Duration::from_secs(config.circuit_breaker_pause_minutes * 60),
            preventive_drain_interval: Duration::from_secs(config.preventive_drain_interval_secs),
            heartbeat_every_cycles: config.heartbeat_every_cycles,
            reconnect_settle_pause: Duration::from_secs(2),
            breaker_denied_pause: Duration::from_secs(60),
        }
    }
}

/// Sliding-window reconnect rate limiter (§4.5).
#[derive(Debug)]
pub struct CircuitBreaker {
    history: VecDeque<Instant>,
    max_per_hour: u32,
    pause: Duration,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(max_per_hour: u32, pause: Duration) -> Self {
        Self { history: VecDeque::new(), max_per_hour, pause, open_until: None }
    }

    pub fn is_open(&self) -> bool {
        self.open_until.is_some()
    }

    fn prune(&mut self, now: Instant) {
        let window = Duration::from_secs(3600);
        while let Some(&front) = self.history.front() {
            if now.duration_since(front) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a reconnect attempt and returns whether it is permitted. The
    /// attempt that pushes the window to its limit is the one that opens the
    /// breaker (the `+1` in the testable property of §8).
    pub fn allow_reconnect(&mut self, now: Instant) -> bool {
        self.prune(now);

        if let Some(until) = self.open_until {
            if now >= until {
                self.open_until = None;
                self.history.clear();
            } else {
                return false;
            }
        }

        if self.history.len() >= self.max_per_hour as usize {
            self.open_until = Some(now + self.pause);
            return false;
        }

        self.history.push_back(now);
        true
    }
}

#[derive(Debug, Default)]
struct WatchdogCounters {
    consecutive_hdlc_errors: u32,
    consecutive_read_failures: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCounters {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub messages_sent: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Stopped cooperatively on an orchestrator/process shutdown request.
    Stopped,
    /// The worker gave up: association was rejected, or reconnection was
    /// exhausted twice in a row. The orchestrator decides whether to restart.
    Crashed(String),
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcome::Stopped => write!(f, "stopped"),
            WorkerOutcome::Crashed(reason) => write!(f, "crashed: {reason}"),
        }
    }
}

enum ReconnectOutcome {
    Reconnected,
    BreakerOpen,
    Failed(String),
}

/// One meter's whole duty cycle: poll, publish, watch, and heal (§4.5).
pub struct Worker<C: TransportConnector, P: Publisher> {
    meter_id: i64,
    meter_name: String,
    interval: Duration,
    measurements: Vec<(String, ObisCode)>,
    client: RobustClient<C>,
    publisher: P,
    thresholds: WorkerThresholds,
    breaker: CircuitBreaker,
    watchdog: WatchdogCounters,
    counters: WorkerCounters,
    last_successful_read: Instant,
    last_connection_time: Instant,
    last_drain: Instant,
    heartbeat_sink: Option<Arc<dyn Fn(i64, i64) + Send + Sync>>,
}

impl<C: TransportConnector, P: Publisher> Worker<C, P> {
    pub fn new(meter: &MeterConfig, connector: C, publisher: P) -> Self {
        let connect_config = &meter.connect;
        let policy = ConnectPolicy {
            max_attempts: connect_config.max_attempts,
            base_delay: connect_config.base_delay(),
            settle_pause: connect_config.settle_pause(),
        };
        let session_config = crate::session::SessionConfig {
            client_address: meter.client_sap,
            server_logical: meter.server_logical,
            server_physical: meter.server_physical,
            password: meter.password.as_bytes().to_vec(),
            max_info_length: connect_config.max_info_length,
            read_timeout: connect_config.read_timeout(),
        };
        let measurements = meter
            .enabled_measurements()
            .into_iter()
            .filter_map(|m| m.obis_code().ok().map(|obis| (m.key.clone(), obis)))
            .collect();
        let thresholds = WorkerThresholds::from(&meter.watchdog);
        let breaker = CircuitBreaker::new(thresholds.max_reconnects_per_hour, thresholds.circuit_breaker_pause);
        let now = Instant::now();

        Self {
            meter_id: meter.id,
            meter_name: meter.name.clone(),
            interval: meter.interval(),
            measurements,
            client: RobustClient::new(connector, session_config, policy),
            publisher,
            thresholds,
            breaker,
            watchdog: WatchdogCounters::default(),
            counters: WorkerCounters::default(),
            last_successful_read: now,
            last_connection_time: now,
            last_drain: now,
            heartbeat_sink: None,
        }
    }

    pub fn with_heartbeat_sink(mut self, sink: Arc<dyn Fn(i64, i64) + Send + Sync>) -> Self {
        self.heartbeat_sink = Some(sink);
        self
    }

    pub fn counters(&self) -> WorkerCounters {
        self.counters
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn emit(&self, severity: Severity, category: Category, message: impl Into<String>) {
        DiagnosticEvent::new(self.meter_id, &self.meter_name, severity, category, message).log();
    }

    /// Connects DLMS, warms up the scaler cache, and records the connection's
    /// establishment time.
    fn initialize(&mut self) -> Result<(), RobustError> {
        self.client.connect(false)?;
        let obis_codes: Vec<ObisCode> = self.measurements.iter().map(|(_, obis)| *obis).collect();
        self.client.warmup_cache(&obis_codes)?;
        self.last_connection_time = Instant::now();
        self.last_successful_read = Instant::now();
        Ok(())
    }

    /// The internal reconnect procedure of §4.5: best-effort close, settle
    /// pause, retry through the robust client's own schedule, and on failure
    /// one further attempt before bubbling up to the orchestrator.
    fn perform_reconnect(&mut self, stop: &AtomicBool) -> Result<(), String> {
        self.client.disconnect();
        interruptible_sleep(stop, self.thresholds.reconnect_settle_pause);

        if self.client.connect(true).is_ok() {
            self.after_reconnect_success();
            return Ok(());
        }

        match self.client.connect(true) {
            Ok(()) => {
                self.after_reconnect_success();
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn after_reconnect_success(&mut self) {
        self.watchdog.consecutive_hdlc_errors = 0;
        self.watchdog.consecutive_read_failures = 0;
        let now = Instant::now();
        self.last_connection_time = now;
        self.last_successful_read = now;
        self.last_drain = now;
        if let Some(reader) = self.client.reader_mut() {
            reader.session_mut().drain_stale_input();
        }
        let obis_codes: Vec<ObisCode> = self.measurements.iter().map(|(_, obis)| *obis).collect();
        let _ = self.client.warmup_cache(&obis_codes);
    }

    /// Opportunistic buffer hygiene: if more than [`DRAIN_HEURISTIC_THRESHOLD`]
    /// bytes are sitting unread on the socket after a cycle, the meter is
    /// almost certainly pushing unsolicited or stale data rather than a
    /// partial response still in flight, so drain it now rather than waiting
    /// for the time-based preventive drain.
    fn maybe_drain_backlog(&mut self) {
        let Some(reader) = self.client.reader_mut() else {
            return;
        };
        let pending = reader.session_mut().transport_mut().peek_pending().unwrap_or(0);
        if pending > DRAIN_HEURISTIC_THRESHOLD {
            reader.session_mut().drain_stale_input();
            self.last_drain = Instant::now();
        }
    }

    fn try_reconnect(&mut self, stop: &AtomicBool, reason: &str) -> ReconnectOutcome {
        if !self.breaker.allow_reconnect(Instant::now()) {
            self.emit(
                Severity::Critical,
                Category::CircuitBreaker,
                format!("circuit breaker open, refusing reconnect ({reason})"),
            );
            return ReconnectOutcome::BreakerOpen;
        }

        self.counters.reconnects += 1;
        match self.perform_reconnect(stop) {
            Ok(()) => ReconnectOutcome::Reconnected,
            Err(e) => {
                self.emit(Severity::Critical, Category::Process, format!("reconnect exhausted: {e}"));
                ReconnectOutcome::Failed(e)
            }
        }
    }

    /// Reads every configured measurement sequentially, returning the
    /// non-null values. A cycle is successful iff at least one value came
    /// back.
    fn run_cycle(&mut self) -> HashMap<String, f64> {
        self.counters.total_cycles += 1;
        let mut values = HashMap::new();

        for (key, obis) in self.measurements.clone() {
            match self.client.read_register(obis, 0) {
                Ok((scaled, _unit, _raw)) => {
                    values.insert(key, scaled);
                }
                Err(RobustError::Session(session_error)) => {
                    if session_error.is_hdlc_category() {
                        self.watchdog.consecutive_hdlc_errors += 1;
                        self.emit(Severity::Warning, Category::Hdlc, format!("{key}: {session_error}"));
                    } else {
                        self.emit(Severity::Warning, Category::Polling, format!("{key}: {session_error}"));
                    }
                }
                Err(other) => {
                    self.emit(Severity::Warning, Category::Connection, format!("{key}: {other}"));
                }
            }
        }

        if values.is_empty() {
            self.watchdog.consecutive_read_failures += 1;
            self.counters.failed_cycles += 1;
        } else {
            self.watchdog.consecutive_hdlc_errors = 0;
            self.watchdog.consecutive_read_failures = 0;
            self.last_successful_read = Instant::now();
            self.counters.successful_cycles += 1;
        }

        values
    }

    fn publish(&mut self, values: &HashMap<String, f64>) {
        let accepted = self.publisher.publish_telemetry(values, Some(now_millis()));
        if accepted {
            self.counters.messages_sent += 1;
        } else {
            self.emit(Severity::Warning, Category::Other, "publish_telemetry rejected by local send path");
        }
    }

    fn maybe_heartbeat(&self) {
        if self.thresholds.heartbeat_every_cycles == 0 || self.counters.total_cycles % self.thresholds.heartbeat_every_cycles != 0 {
            return;
        }
        info!(
            "[{}] heartbeat: cycles={} successful={} failed={} messages={}",
            self.meter_name, self.counters.total_cycles, self.counters.successful_cycles, self.counters.failed_cycles, self.counters.messages_sent
        );
        if let Some(sink) = &self.heartbeat_sink {
            sink(self.meter_id, now_millis());
        }
    }

    /// Sleeps for `self.interval`, checking `stop` every 100 ms so a stop
    /// request is observed promptly rather than at the next loop head (§5).
    fn sleep_until_next_cycle(&self, stop: &AtomicBool, elapsed: Duration) {
        interruptible_sleep(stop, self.interval.saturating_sub(elapsed));
    }

    fn log_final_stats(&self) {
        info!(
            "[{}] final stats: cycles={} successful={} failed={} messages_sent={} reconnects={}",
            self.meter_name,
            self.counters.total_cycles,
            self.counters.successful_cycles,
            self.counters.failed_cycles,
            self.counters.messages_sent,
            self.counters.reconnects
        );
    }

    /// Runs the duty cycle until `stop` is set or the worker gives up.
    /// Closes the DLMS session before returning either way.
    pub fn run(&mut self, stop: &AtomicBool) -> WorkerOutcome {
        if let Err(e) = self.initialize() {
            self.emit(Severity::Critical, Category::Startup, format!("initial connect failed: {e}"));
            return WorkerOutcome::Crashed(e.to_string());
        }

        let outcome = loop {
            if stop.load(Ordering::Relaxed) {
                break WorkerOutcome::Stopped;
            }

            if self.last_drain.elapsed() >= self.thresholds.preventive_drain_interval {
                if let Some(reader) = self.client.reader_mut() {
                    reader.session_mut().drain_stale_input();
                }
                self.last_drain = Instant::now();
            }

            if self.last_successful_read.elapsed() >= self.thresholds.max_silence {
                let minutes = self.last_successful_read.elapsed().as_secs() / 60;
                self.emit(
                    Severity::Critical,
                    Category::Watchdog,
                    format!("no successful cycle in {minutes} minutes, forcing reconnect"),
                );
                match self.try_reconnect(stop, "silence watchdog") {
                    ReconnectOutcome::Reconnected => continue,
                    ReconnectOutcome::BreakerOpen => {
                        interruptible_sleep(stop, self.thresholds.breaker_denied_pause);
                        continue;
                    }
                    ReconnectOutcome::Failed(reason) => break WorkerOutcome::Crashed(reason),
                }
            }

            if self.watchdog.consecutive_hdlc_errors >= self.thresholds.max_consecutive_hdlc_errors {
                self.emit(
                    Severity::Critical,
                    Category::Watchdog,
                    format!("{} consecutive HDLC errors, forcing reconnect", self.watchdog.consecutive_hdlc_errors),
                );
                match self.try_reconnect(stop, "consecutive HDLC errors") {
                    ReconnectOutcome::Reconnected => continue,
                    ReconnectOutcome::BreakerOpen => {
                        interruptible_sleep(stop, self.thresholds.breaker_denied_pause);
                        continue;
                    }
                    ReconnectOutcome::Failed(reason) => break WorkerOutcome::Crashed(reason),
                }
            }

            if self.watchdog.consecutive_read_failures >= self.thresholds.max_consecutive_read_failures {
                self.emit(
                    Severity::Critical,
                    Category::Watchdog,
                    format!("{} consecutive read failures, forcing reconnect", self.watchdog.consecutive_read_failures),
                );
                match self.try_reconnect(stop, "consecutive read failures") {
                    ReconnectOutcome::Reconnected => continue,
                    ReconnectOutcome::BreakerOpen => {
                        interruptible_sleep(stop, self.thresholds.breaker_denied_pause);
                        continue;
                    }
                    ReconnectOutcome::Failed(reason) => break WorkerOutcome::Crashed(reason),
                }
            }

            if self.last_connection_time.elapsed() >= self.thresholds.connection_max_age {
                info!("[{}] connection age exceeded limit, preventive reconnect", self.meter_name);
                match self.try_reconnect(stop, "preventive connection age") {
                    ReconnectOutcome::Reconnected => continue,
                    ReconnectOutcome::BreakerOpen => {
                        // Breaker denial resets the age timer so we don't
                        // tight-loop retrying every cycle head (§4.5).
                        self.last_connection_time = Instant::now();
                    }
                    ReconnectOutcome::Failed(reason) => break WorkerOutcome::Crashed(reason),
                }
            }

            let cycle_start = Instant::now();
            let values = self.run_cycle();
            self.maybe_drain_backlog();

            if values.is_empty() {
                match self.try_reconnect(stop, "full cycle failure") {
                    ReconnectOutcome::Reconnected => {}
                    ReconnectOutcome::BreakerOpen => {}
                    ReconnectOutcome::Failed(reason) => break WorkerOutcome::Crashed(reason),
                }
            } else {
                self.publish(&values);
                self.maybe_heartbeat();
            }

            self.sleep_until_next_cycle(stop, cycle_start.elapsed());
        };

        self.client.disconnect();
        self.log_final_stats();
        outcome
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sleeps for `duration` in 100 ms increments, returning early once `stop` is
/// set so a shutdown request never has to wait out a full pause (§4.7, §5).
fn interruptible_sleep(stop: &AtomicBool, duration: Duration) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < duration {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let chunk = step.min(duration - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
}
