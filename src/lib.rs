//! A field bridge that polls DLMS/COSEM electricity meters over HDLC
//! framing and publishes telemetry to an MQTT broker.
//!
//! The protocol stack ([`hdlc`], [`association`], [`session`], [`register`])
//! is sequential and transport-agnostic over the [`transport::Transport`]
//! trait. [`robust`] adds reconnection on top of it, [`worker`] runs one
//! meter's duty cycle, and [`orchestrator`] supervises a fleet of them.

pub mod association;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod hdlc;
pub mod mqtt;
pub mod obis;
pub mod orchestrator;
pub mod register;
pub mod robust;
pub mod session;
pub mod transport;
pub mod unit;
pub mod worker;

/// Initializes the `env_logger` backend for the `log` facade at `level`,
/// honoring `RUST_LOG` if set.
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env().filter_level(level).format_timestamp_millis().init();
}
