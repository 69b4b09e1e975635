//! Scaler/unit cache wrapping a [`Session`], amortizing the attribute-3 read
//! across polls of the same register (§4.3).

use std::collections::HashMap;

use crate::obis::ObisCode;
use crate::session::{Session, SessionError};
use crate::transport::Transport;
use crate::unit::{ScalerUnit, Unit};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A register reader that caches each OBIS's (scaler, unit) pair so a steady
/// poll only needs the value attribute.
pub struct RegisterReader<T: Transport> {
    session: Session<T>,
    cache: HashMap<ObisCode, ScalerUnit>,
    stats: CacheStats,
}

impl<T: Transport> RegisterReader<T> {
    pub fn new(session: Session<T>) -> Self {
        Self {
            session,
            cache: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn into_session(self) -> Session<T> {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cache entry and resets hit/miss counters; called whenever a
    /// DLMS session is re-established, since a new association invalidates
    /// nothing in the meter but makes no promise the cached shape still holds.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.stats = CacheStats::default();
    }

    /// Performs a full read (attribute 3 then attribute 2) for each OBIS,
    /// caching the scaler/unit on success. Individual failures are returned to
    /// the caller to log; warmup itself never stops early.
    pub fn warmup_cache(&mut self, obis_codes: &[ObisCode]) -> Vec<(ObisCode, Result<(), SessionError>)> {
        obis_codes
            .iter()
            .map(|&obis| {
                let result = self.full_read(obis).map(|(scaler_unit, _raw)| {
                    self.cache.insert(obis, scaler_unit);
                });
                (obis, result)
            })
            .collect()
    }

    fn full_read(&mut self, obis: ObisCode) -> Result<(ScalerUnit, i64), SessionError> {
        let scaler_data = self.session.get_attribute(3, obis, 3)?;
        let scaler_unit = ScalerUnit::from_data(&scaler_data)?;
        let value_data = self.session.get_attribute(3, obis, 2)?;
        let raw = value_data.as_i64().ok_or(SessionError::MalformedGetResponse)?;
        Ok((scaler_unit, raw))
    }

    /// Reads `obis`, using the cached scaler/unit when available so only the
    /// value attribute is fetched from the meter. On a cache miss, performs a
    /// full read and populates the cache for next time.
    pub fn read_optimized(&mut self, obis: ObisCode) -> Result<(f64, Unit, i64), SessionError> {
        if let Some(&cached) = self.cache.get(&obis) {
            self.stats.hits += 1;
            let value_data = self.session.get_attribute(3, obis, 2)?;
            let raw = value_data.as_i64().ok_or(SessionError::MalformedGetResponse)?;
            let scaled = raw as f64 * 10f64.powi(cached.scaler as i32);
            return Ok((scaled, cached.unit, raw));
        }

        self.stats.misses += 1;
        let (scaler_unit, raw) = self.full_read(obis)?;
        let scaled = raw as f64 * 10f64.powi(scaler_unit.scaler as i32);
        self.cache.insert(obis, scaler_unit);
        Ok((scaled, scaler_unit.unit, raw))
    }
}
