//! Live Telemetry
//!
//! Polls ECU parameters, converts raw values to engineering units and keeps
//! the most recent samples in a bounded ring buffer.

mod reader;
mod ring;

pub use reader::{ParameterReads, TelemetryReader};
pub use ring::SampleRing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::{LinkError, RetryPolicy, DEFAULT_TIMEOUT_MS};

/// ECU parameter identifier
pub type ParameterId = u16;

/// Default number of samples kept in memory
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// One decoded parameter reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// When the response was received
    pub timestamp: DateTime<Utc>,
    /// Parameter that was read
    pub parameter_id: ParameterId,
    /// Value as reported by the ECU
    pub raw_value: i32,
    /// `raw_value * scale + offset`
    pub decoded_value: f64,
}

/// How to present a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Wire id
    pub id: ParameterId,
    /// Short name, e.g. `rpm`
    pub name: String,
    /// Display unit of the decoded value
    pub unit: String,
    /// Multiplier applied to the raw value
    pub scale: f64,
    /// Added after scaling
    pub offset: f64,
}

impl ParameterDef {
    /// Define a parameter as `raw * scale + offset`
    pub fn new(id: ParameterId, name: &str, unit: &str, scale: f64, offset: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            unit: unit.to_string(),
            scale,
            offset,
        }
    }

    /// Convert a raw ECU value to engineering units
    pub fn decode(&self, raw: i32) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    /// Convert an engineering value back to the nearest raw value
    pub fn encode(&self, value: f64) -> i32 {
        if self.scale == 0.0 {
            return 0;
        }
        ((value - self.offset) / self.scale)
            .round()
            .clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }
}

/// Parameter definitions by id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterCatalog {
    parameters: HashMap<ParameterId, ParameterDef>,
}

impl ParameterCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition
    pub fn insert(&mut self, def: ParameterDef) {
        self.parameters.insert(def.id, def);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, def: ParameterDef) -> Self {
        self.insert(def);
        self
    }

    /// Definition of `id`, if known
    pub fn get(&self, id: ParameterId) -> Option<&ParameterDef> {
        self.parameters.get(&id)
    }

    /// Decode a raw value; unknown parameters pass through unscaled
    pub fn decode(&self, id: ParameterId, raw: i32) -> f64 {
        self.get(id).map_or(raw as f64, |def| def.decode(raw))
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether no parameter is defined
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Common single-cylinder motorcycle ECU channels
    pub fn motorcycle_defaults() -> Self {
        Self::new()
            .with(ParameterDef::new(0x10, "rpm", "rpm", 1.0, 0.0))
            .with(ParameterDef::new(0x11, "throttle", "%", 0.1, 0.0))
            .with(ParameterDef::new(0x12, "coolant", "°C", 0.1, -40.0))
            .with(ParameterDef::new(0x13, "intake_air", "°C", 0.1, -40.0))
            .with(ParameterDef::new(0x14, "battery", "V", 0.01, 0.0))
            .with(ParameterDef::new(0x20, "afr", "AFR", 0.01, 0.0))
            .with(ParameterDef::new(0x21, "ignition_advance", "°", 0.5, -20.0))
            .with(ParameterDef::new(0x22, "injector_pw", "ms", 0.001, 0.0))
    }
}

/// Telemetry polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Time to wait for each READ_PARAM response in milliseconds
    pub read_timeout_ms: u64,
    /// Retry policy for a parameter that timed out or came back garbled
    pub retry: RetryPolicy,
    /// Samples kept in the ring buffer
    pub ring_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl TelemetryConfig {
    /// Reject zero timeouts and an empty ring
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.read_timeout_ms == 0 {
            return Err(LinkError::Config("read_timeout_ms must be non-zero".into()));
        }
        if self.ring_capacity == 0 {
            return Err(LinkError::Config("ring_capacity must be non-zero".into()));
        }
        Ok(())
    }
}
