//! Ambient error type for configuration loading and bridge startup (§10.2).
//!
//! Protocol-layer errors ([`crate::hdlc::HdlcError`], [`crate::session::SessionError`],
//! [`crate::association::AssociationError`]) stay as their own hand-rolled enums
//! because the worker inspects them programmatically. Everything here exists
//! to be formatted for a human operator or returned from `main`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("no meters configured")]
    NoMeters,

    #[error("meter {0:?} has no measurements configured")]
    NoMeasurements(String),

    #[error("failed to set up signal handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),
}
