//! Supervises one worker thread per meter: startup, restart-on-death,
//! stale-heartbeat detection, and alarm throttling (§4.7), grounded in
//! `admin/orchestrator.py`'s `MeterOrchestrator` but with `std::thread`
//! standing in for the original's `multiprocessing.Process`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::{BridgeConfig, MeterConfig};
use crate::diagnostics::{Category, DiagnosticEvent, Severity};
use crate::mqtt::{EitherPublisher, MqttPublisher, NullPublisher};
use crate::transport::tcp::TcpConnector;
use crate::worker::{Worker, WorkerOutcome};

const STALE_HEARTBEAT_AFTER: Duration = Duration::from_secs(60);

/// Snapshot returned by [`Orchestrator::get_meter_status`]/`get_all_statuses`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterStatus {
    pub meter_id: i64,
    pub running: bool,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
}

struct ManagedMeter {
    handle: JoinHandle<WorkerOutcome>,
    stop: Arc<AtomicBool>,
    started_at: Instant,
    last_heartbeat: Arc<Mutex<Instant>>,
    restart_count: u32,
}

/// Builds the MQTT client id the way `admin/orchestrator.py`'s
/// `_poller_worker` does: a sanitized meter name with a uniquifying suffix,
/// here the meter's configured id rather than an OS pid (several workers in
/// one process would otherwise collide on a shared pid).
fn mqtt_client_id(meter: &MeterConfig) -> String {
    let sanitized: String = meter.name.chars().map(|c| if c == ' ' || c == '-' { '_' } else { c }).collect();
    format!("{sanitized}_{}", meter.id)
}

fn build_publisher(meter: &MeterConfig) -> Result<EitherPublisher, String> {
    if !meter.publisher.enabled || meter.publisher.device_token.is_empty() {
        return Ok(EitherPublisher::Null(NullPublisher));
    }
    MqttPublisher::connect(
        &meter.publisher.broker_host,
        meter.publisher.broker_port,
        &mqtt_client_id(meter),
        &meter.publisher.device_token,
        meter.publisher.connect_timeout(),
        meter.publisher.keepalive(),
        Some(meter.publisher.max_offline_messages),
    )
    .map(EitherPublisher::Mqtt)
    .map_err(|e| e.to_string())
}

/// Owns the full fleet of meter workers. Cloned cheaply (an `Arc` inside):
/// share one instance between the health-check loop and a signal handler.
pub struct Orchestrator {
    meters_config: HashMap<i64, MeterConfig>,
    health_check_interval: Duration,
    restart_on_failure: bool,
    max_restart_attempts: u32,
    alarm_throttle_window: Duration,
    stop_grace: Duration,
    managed: Mutex<HashMap<i64, ManagedMeter>>,
    alarm_last: Mutex<HashMap<(i64, Category), Instant>>,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: &BridgeConfig) -> Self {
        let meters_config = config.meters.iter().map(|m| (m.id, m.clone())).collect();
        Self {
            meters_config,
            health_check_interval: config.health_check_interval(),
            restart_on_failure: config.restart_on_failure,
            max_restart_attempts: config.max_restart_attempts,
            alarm_throttle_window: config.alarm_throttle(),
            stop_grace: config.stop_grace(),
            managed: Mutex::new(HashMap::new()),
            alarm_last: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Starts a worker thread for every configured meter.
    pub fn start(self: &Arc<Self>) {
        info!("starting orchestrator with {} configured meters", self.meters_config.len());
        self.running.store(true, Ordering::SeqCst);
        let ids: Vec<i64> = self.meters_config.keys().copied().collect();
        for id in ids {
            self.start_meter(id);
        }
    }

    /// Stops every running worker and marks the orchestrator stopped.
    pub fn stop(self: &Arc<Self>) {
        info!("stopping orchestrator");
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<i64> = self.managed.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.stop_meter(id);
        }
    }

    pub fn start_meter(self: &Arc<Self>, meter_id: i64) -> bool {
        let Some(meter) = self.meters_config.get(&meter_id).cloned() else {
            error!("meter {meter_id} not found in configuration");
            return false;
        };
        if self.managed.lock().unwrap().contains_key(&meter_id) {
            warn!("meter {meter_id} already running");
            return false;
        }
        let managed = self.spawn_meter(meter);
        self.managed.lock().unwrap().insert(meter_id, managed);
        true
    }

    fn spawn_meter(&self, meter: MeterConfig) -> ManagedMeter {
        let stop = Arc::new(AtomicBool::new(false));
        let last_heartbeat = Arc::new(Mutex::new(Instant::now()));
        let stop_for_thread = Arc::clone(&stop);
        let heartbeat_for_thread = Arc::clone(&last_heartbeat);
        let meter_id = meter.id;
        let meter_name = meter.name.clone();

        let handle = thread::Builder::new()
            .name(format!("meter-{meter_id}"))
            .spawn(move || -> WorkerOutcome {
                let connector = TcpConnector {
                    host: meter.host.clone(),
                    port: meter.port,
                    connect_timeout: meter.connect.read_timeout(),
                };
                let publisher = match build_publisher(&meter) {
                    Ok(publisher) => publisher,
                    Err(reason) => {
                        DiagnosticEvent::new(
                            meter_id,
                            &meter_name,
                            Severity::Critical,
                            Category::Startup,
                            format!("mqtt connect failed: {reason}"),
                        )
                        .log();
                        return WorkerOutcome::Crashed(format!("mqtt connect failed: {reason}"));
                    }
                };

                let heartbeat_sink = Arc::clone(&heartbeat_for_thread);
                let mut worker = Worker::new(&meter, connector, publisher)
                    .with_heartbeat_sink(Arc::new(move |_meter_id, _timestamp_ms| {
                        *heartbeat_sink.lock().unwrap() = Instant::now();
                    }));
                worker.run(&stop_for_thread)
            })
            .expect("failed to spawn meter worker thread");

        ManagedMeter { handle, stop, started_at: Instant::now(), last_heartbeat, restart_count: 0 }
    }

    /// Signals `stop` then joins with a bounded wait of `stop_grace` (§4.7,
    /// §5). `std::thread::JoinHandle` has no timed join, so this polls
    /// `is_finished` in 100 ms steps; a worker still running past the grace
    /// period is logged and abandoned rather than blocking shutdown forever.
    pub fn stop_meter(self: &Arc<Self>, meter_id: i64) -> bool {
        let managed = self.managed.lock().unwrap().remove(&meter_id);
        let Some(managed) = managed else {
            warn!("meter {meter_id} not running");
            return false;
        };
        managed.stop.store(true, Ordering::SeqCst);

        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while !managed.handle.is_finished() && waited < self.stop_grace {
            let chunk = step.min(self.stop_grace - waited);
            thread::sleep(chunk);
            waited += chunk;
        }

        if managed.handle.is_finished() {
            match managed.handle.join() {
                Ok(outcome) => info!("meter {meter_id} worker joined: {outcome}"),
                Err(_) => error!("meter {meter_id} worker thread panicked"),
            }
        } else {
            error!("meter {meter_id} worker did not stop within {:?}, abandoning join", self.stop_grace);
        }
        true
    }

    pub fn restart_meter(self: &Arc<Self>, meter_id: i64) -> bool {
        info!("restarting meter {meter_id}");
        self.stop_meter(meter_id);
        thread::sleep(Duration::from_secs(1));
        self.start_meter(meter_id)
    }

    pub fn get_meter_status(&self, meter_id: i64) -> MeterStatus {
        let managed = self.managed.lock().unwrap();
        match managed.get(&meter_id) {
            Some(m) => MeterStatus {
                meter_id,
                running: !m.handle.is_finished(),
                uptime_secs: Some(m.started_at.elapsed().as_secs()),
                restart_count: m.restart_count,
            },
            None => MeterStatus { meter_id, running: false, uptime_secs: None, restart_count: 0 },
        }
    }

    pub fn get_all_statuses(&self) -> Vec<MeterStatus> {
        self.meters_config.keys().map(|&id| self.get_meter_status(id)).collect()
    }

    fn should_alarm(&self, meter_id: i64, category: Category, now: Instant) -> bool {
        let mut last = self.alarm_last.lock().unwrap();
        match last.get(&(meter_id, category)) {
            Some(&previous) if now.duration_since(previous) < self.alarm_throttle_window => false,
            _ => {
                last.insert((meter_id, category), now);
                true
            }
        }
    }

    fn emit_alarm(&self, meter_id: i64, severity: Severity, category: Category, message: impl Into<String>) {
        let name = self.meters_config.get(&meter_id).map(|m| m.name.as_str()).unwrap_or("unknown").to_string();
        let event = DiagnosticEvent::new(meter_id, &name, severity, category, message);
        if self.should_alarm(meter_id, category, Instant::now()) {
            event.log();
        } else {
            event.log_suppressed();
        }
    }

    /// One health-check pass: restarts dead workers (bounded by
    /// `max_restart_attempts`) and flags workers whose heartbeat has gone
    /// stale, mirroring `_perform_health_checks`.
    fn perform_health_checks(self: &Arc<Self>) {
        let dead_or_stale: Vec<(i64, bool, Duration)> = {
            let managed = self.managed.lock().unwrap();
            managed
                .iter()
                .map(|(&id, m)| {
                    let dead = m.handle.is_finished();
                    let staleness = m.last_heartbeat.lock().unwrap().elapsed();
                    (id, dead, staleness)
                })
                .collect()
        };

        for (meter_id, dead, staleness) in dead_or_stale {
            if dead {
                self.emit_alarm(meter_id, Severity::Critical, Category::Process, "worker thread died unexpectedly");

                if !self.restart_on_failure {
                    continue;
                }
                let restart_count = self.managed.lock().unwrap().remove(&meter_id).map(|m| m.restart_count).unwrap_or(0);
                if restart_count >= self.max_restart_attempts {
                    error!("meter {meter_id}: max restart attempts ({}) reached, giving up", self.max_restart_attempts);
                    continue;
                }
                info!("restarting meter {meter_id} (attempt {})", restart_count + 1);
                if let Some(meter) = self.meters_config.get(&meter_id).cloned() {
                    let mut managed = self.spawn_meter(meter);
                    managed.restart_count = restart_count + 1;
                    self.managed.lock().unwrap().insert(meter_id, managed);
                }
            } else if staleness > STALE_HEARTBEAT_AFTER {
                self.emit_alarm(
                    meter_id,
                    Severity::Warning,
                    Category::Watchdog,
                    format!("no heartbeat for {}s", staleness.as_secs()),
                );
            }
        }
    }

    /// Runs health checks on `health_check_interval` until [`Orchestrator::stop`]
    /// clears the running flag. Intended to be driven from its own thread.
    pub fn health_check_loop(self: &Arc<Self>) {
        info!("health check loop started");
        while self.running.load(Ordering::SeqCst) {
            self.perform_health_checks();
            thread::sleep(self.health_check_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectConfig, MeasurementConfig, PublisherConfig, WatchdogConfig};

    fn meter(id: i64) -> MeterConfig {
        MeterConfig {
            id,
            name: format!("Meter {id}"),
            host: "127.0.0.1".to_string(),
            port: 4059,
            client_sap: 0x10,
            server_logical: 1,
            server_physical: 1,
            password: "22222222".to_string(),
            measurements: vec![MeasurementConfig {
                key: "voltage_l1".to_string(),
                obis: "1-1:32.7.0".to_string(),
                preferred_unit: None,
                enabled: true,
            }],
            interval_secs: 1,
            publisher: PublisherConfig {
                enabled: false,
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                device_token: String::new(),
                device_name: None,
                max_offline_messages: 100,
                connect_timeout_secs: 1,
                keepalive_secs: 60,
            },
            connect: ConnectConfig {
                max_attempts: 1,
                base_delay_secs: 0,
                settle_pause_millis: 1,
                read_timeout_secs: 1,
                max_info_length: None,
            },
            watchdog: WatchdogConfig::default(),
        }
    }

    fn config_with(meters: Vec<MeterConfig>) -> BridgeConfig {
        BridgeConfig {
            health_check_interval_secs: 10,
            restart_on_failure: true,
            max_restart_attempts: 3,
            alarm_throttle_secs: 300,
            stop_grace_secs: 5,
            meters,
        }
    }

    #[test]
    fn test_mqtt_client_id_sanitizes_spaces_and_dashes() {
        let m = meter(7);
        let mut named = m.clone();
        named.name = "Main-Street Meter".to_string();
        assert_eq!(mqtt_client_id(&named), "Main_Street_Meter_7");
    }

    #[test]
    fn test_status_of_unknown_meter_is_not_running() {
        let orchestrator = Arc::new(Orchestrator::new(&config_with(vec![meter(1)])));
        let status = orchestrator.get_meter_status(999);
        assert!(!status.running);
        assert_eq!(status.restart_count, 0);
    }

    #[test]
    fn test_start_meter_fails_for_unknown_id() {
        let orchestrator = Arc::new(Orchestrator::new(&config_with(vec![meter(1)])));
        assert!(!orchestrator.start_meter(42));
    }

    #[test]
    fn test_stop_meter_fails_when_not_running() {
        let orchestrator = Arc::new(Orchestrator::new(&config_with(vec![meter(1)])));
        assert!(!orchestrator.stop_meter(1));
    }

    #[test]
    fn test_start_then_stop_meter_joins_cleanly() {
        // This meter's host has nothing listening, so the worker crashes
        // immediately on its first connect attempt; stop_meter must still
        // join the (already-finished) thread without hanging.
        let orchestrator = Arc::new(Orchestrator::new(&config_with(vec![meter(1)])));
        assert!(orchestrator.start_meter(1));
        thread::sleep(Duration::from_millis(200));
        assert!(orchestrator.stop_meter(1));
    }

    #[test]
    fn test_alarm_throttling_suppresses_within_window() {
        let orchestrator = Orchestrator::new(&config_with(vec![meter(1)]));
        let now = Instant::now();
        assert!(orchestrator.should_alarm(1, Category::Process, now));
        assert!(!orchestrator.should_alarm(1, Category::Process, now + Duration::from_secs(1)));
        assert!(orchestrator.should_alarm(1, Category::Process, now + Duration::from_secs(301)));
    }

    #[test]
    fn test_alarm_throttling_is_independent_per_category() {
        let orchestrator = Orchestrator::new(&config_with(vec![meter(1)]));
        let now = Instant::now();
        assert!(orchestrator.should_alarm(1, Category::Process, now));
        assert!(orchestrator.should_alarm(1, Category::Watchdog, now));
    }

    #[test]
    fn test_get_all_statuses_covers_every_configured_meter() {
        let orchestrator = Orchestrator::new(&config_with(vec![meter(1), meter(2)]));
        let statuses = orchestrator.get_all_statuses();
        assert_eq!(statuses.len(), 2);
    }
}
