//! Instrument driver capability interface.
//!
//! The orchestration engine never talks to hardware directly; it drives one
//! [`MeasurementDriver`] capability object per slot. The trait is the
//! interface boundary of the system - the wire protocol behind it is a driver
//! concern. Cancellation support is an explicit, typed capability: a driver
//! either honors [`MeasurementDriver::request_abort`] or reports
//! [`AbortOutcome::Unsupported`], which the orchestrator treats as a
//! legitimate no-op. There is no reflection-style probing for abort methods.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod directory;
pub mod mock;

pub use directory::{DeviceDirectory, DiscoveredDevice, DriverFactory};
pub use mock::{MockDriver, MockDriverFactory};

/// Everything a driver needs to run one measurement and persist its output.
#[derive(Debug, Clone)]
pub struct MeasurementSpec {
    /// Measurement technique name (e.g. "CV", "EIS")
    pub mode: String,
    /// Mode-specific parameter bundle, passed through opaquely
    pub params: Map<String, Value>,
    /// Transimpedance amplifier gain selector
    pub tia_gain: Option<i64>,
    /// Sampling interval override in seconds
    pub sampling_interval: Option<f64>,
    /// Output file name inside `folder`
    pub filename: String,
    /// Directory the driver writes its output into
    pub folder: PathBuf,
}

/// Result of a best-effort abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The driver accepted the abort request
    Requested,
    /// The driver does not support aborting an in-flight measurement
    Unsupported,
    /// The driver supports aborting but the request failed
    Failed,
}

/// Static description of one bound device, surfaced by `/devices`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable slot identifier (e.g. "slot01")
    pub slot: String,
    /// Port or address the device was discovered on
    pub port: String,
    /// Hardware serial number, when known
    pub sn: Option<String>,
}

/// Capability object controlling one measurement instrument.
#[async_trait]
pub trait MeasurementDriver: Send + Sync {
    /// Run one measurement to completion, writing output files into
    /// `spec.folder`. Blocks (asynchronously) for the full measurement
    /// duration; errors surface verbatim as the slot's failure message.
    async fn apply_measurement(&self, spec: MeasurementSpec) -> Result<()>;

    /// Measurement techniques this instrument supports.
    async fn available_modes(&self) -> Result<Vec<String>>;

    /// Parameter schema of one mode, as field name to type/description text.
    async fn mode_params(&self, mode: &str) -> Result<BTreeMap<String, String>>;

    /// Best-effort request to stop an in-flight measurement. Advisory only:
    /// the measurement future still completes on its own, and the scheduler
    /// treats the slot as cancelled regardless of what the hardware does.
    async fn request_abort(&self) -> AbortOutcome {
        AbortOutcome::Unsupported
    }

    /// Release the underlying transport. Called on rescan and shutdown.
    async fn close(&self) {}
}
