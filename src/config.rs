//! Bridge configuration: a TOML file describing every meter, its measurement
//! list, and the watchdog/circuit-breaker/publisher tunables (§3, §10.3).

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::obis::ObisCode;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeasurementConfig {
    /// User-visible key, e.g. `voltage_l1`.
    pub key: String,
    pub obis: String,
    #[serde(default)]
    pub preferred_unit: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MeasurementConfig {
    pub fn obis_code(&self) -> Result<ObisCode, crate::obis::ParseObisCodeError> {
        self.obis.parse()
    }

    pub fn preferred_unit(&self) -> Option<&str> {
        self.preferred_unit.as_deref()
    }
}

fn default_true() -> bool {
    true
}

/// Watchdog, circuit breaker, and connection-lifecycle tunables (§4.5), with
/// the defaults named throughout that section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub max_consecutive_hdlc_errors: u32,
    pub max_consecutive_read_failures: u32,
    pub max_silence_minutes: u64,
    pub connection_max_age_minutes: u64,
    pub max_reconnects_per_hour: u32,
    pub circuit_breaker_pause_minutes: u64,
    pub preventive_drain_interval_secs: u64,
    pub heartbeat_every_cycles: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_consecutive_hdlc_errors: 15,
            max_consecutive_read_failures: 10,
            max_silence_minutes: 10,
            connection_max_age_minutes: 30,
            max_reconnects_per_hour: 10,
            circuit_breaker_pause_minutes: 5,
            preventive_drain_interval_secs: 45,
            heartbeat_every_cycles: 60,
        }
    }
}

/// DLMS connect/retry tunables (§4.4).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub settle_pause_millis: u64,
    pub read_timeout_secs: u64,
    /// HDLC max-info-field-length to negotiate in SNRM. `None` (the default)
    /// sends an empty SNRM info field and lets the meter pick its own.
    pub max_info_length: Option<u16>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
            settle_pause_millis: 500,
            read_timeout_secs: 7,
            max_info_length: None,
        }
    }
}

impl ConnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn settle_pause(&self) -> Duration {
        Duration::from_millis(self.settle_pause_millis)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Per-meter MQTT publisher settings (§4.6, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    pub device_token: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_max_offline_messages")]
    pub max_offline_messages: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_max_offline_messages() -> usize {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    60
}

impl PublisherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// One meter's full identity, addressing, measurement list, and overrides
/// (§3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeterConfig {
    pub id: i64,
    pub name: String,
    pub host: String,
    #[serde(default = "default_dlms_port")]
    pub port: u16,
    #[serde(default = "default_client_sap")]
    pub client_sap: u32,
    #[serde(default)]
    pub server_logical: u16,
    #[serde(default = "default_server_physical")]
    pub server_physical: u16,
    pub password: String,
    pub measurements: Vec<MeasurementConfig>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

fn default_dlms_port() -> u16 {
    4059
}

fn default_client_sap() -> u32 {
    0x10
}

fn default_server_physical() -> u16 {
    1
}

fn default_interval_secs() -> u64 {
    5
}

impl MeterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn enabled_measurements(&self) -> Vec<&MeasurementConfig> {
        self.measurements.iter().filter(|m| m.enabled).collect()
    }
}

/// Top-level configuration file (§10.3).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_alarm_throttle_secs")]
    pub alarm_throttle_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    pub meters: Vec<MeterConfig>,
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_alarm_throttle_secs() -> u64 {
    300
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl BridgeConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn alarm_throttle(&self) -> Duration {
        Duration::from_secs(self.alarm_throttle_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Loads and parses `path`. A single meter entry with an unparseable OBIS
/// code is dropped with a `warn!`, not the whole file (§10.3).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BridgeConfig, BridgeError> {
    let path_str = path.as_ref().display().to_string();
    let contents = fs::read_to_string(&path).map_err(|source| BridgeError::ConfigRead { path: path_str.clone(), source })?;
    let mut config: BridgeConfig =
        toml::from_str(&contents).map_err(|source| BridgeError::ConfigParse { path: path_str, source })?;

    for meter in &mut config.meters {
        meter.measurements.retain(|measurement| match measurement.obis_code() {
            Ok(_) => true,
            Err(e) => {
                warn!("meter {:?}: dropping measurement {:?}: {e}", meter.name, measurement.key);
                false
            }
        });
    }

    Ok(config)
}
