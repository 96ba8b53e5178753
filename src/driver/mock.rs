//! A mock potentiostat driver that generates synthetic measurement files.
//!
//! Used by the integration tests and for demo operation without hardware.
//! The mock honors the parts of the driver contract the orchestrator relies
//! on: it blocks for a configurable duration, supports best-effort abort,
//! fails on demand, and writes a CSV output file like a real acquisition.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;

use super::{AbortOutcome, DiscoveredDevice, DriverFactory, MeasurementDriver, MeasurementSpec};

/// Synthetic driver for tests and hardware-free operation.
///
/// Behavior hooks read from the parameter bundle:
/// - `mock_duration_ms`: how long the measurement blocks (default 10 ms)
/// - `mock_fail`: any truthy value makes the measurement fail with its text
pub struct MockDriver {
    port: String,
    abort: Notify,
    calls: AtomicUsize,
}

impl MockDriver {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            abort: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `apply_measurement` invocations seen so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn duration(spec: &MeasurementSpec) -> Duration {
        let ms = spec
            .params
            .get("mock_duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl MeasurementDriver for MockDriver {
    async fn apply_measurement(&self, spec: MeasurementSpec) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = spec.params.get("mock_fail") {
            return Err(anyhow!("mock measurement failed: {reason}"));
        }

        // Write the output up front, like a streaming acquisition would.
        let csv_path: PathBuf = spec.folder.join(&spec.filename);
        let body = format!(
            "t_s,potential_V,current_A\n0.0,0.0,0.0\n# mode={} port={}\n",
            spec.mode, self.port
        );
        tokio::fs::write(&csv_path, body).await?;

        tokio::select! {
            _ = tokio::time::sleep(Self::duration(&spec)) => {}
            _ = self.abort.notified() => {}
        }
        Ok(())
    }

    async fn available_modes(&self) -> Result<Vec<String>> {
        Ok(vec![
            "CV".into(),
            "LSV".into(),
            "CA".into(),
            "OCP".into(),
            "EIS".into(),
        ])
    }

    async fn mode_params(&self, mode: &str) -> Result<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        match mode.to_uppercase().as_str() {
            "CV" => {
                for field in ["start", "vertex1", "vertex2", "end", "scan_rate"] {
                    params.insert(field.to_string(), "float (V or V/s)".to_string());
                }
                params.insert("cycles".to_string(), "int".to_string());
            }
            "LSV" => {
                for field in ["start", "end", "scan_rate"] {
                    params.insert(field.to_string(), "float".to_string());
                }
            }
            "CA" | "OCP" => {
                params.insert("duration".to_string(), "float (s)".to_string());
            }
            "EIS" => {
                for field in ["start_freq", "end_freq", "points_per_decade"] {
                    params.insert(field.to_string(), "float".to_string());
                }
                params.insert("spacing".to_string(), "\"log\" or \"lin\"".to_string());
            }
            other => return Err(anyhow!("unknown mode '{other}'")),
        }
        Ok(params)
    }

    async fn request_abort(&self) -> AbortOutcome {
        // notify_one stores a permit, so an abort that lands between the
        // output write and the sleep still interrupts the measurement
        self.abort.notify_one();
        AbortOutcome::Requested
    }
}

/// Factory binding a fixed number of mock devices.
pub struct MockDriverFactory {
    count: usize,
}

impl MockDriverFactory {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok((0..self.count)
            .map(|i| {
                let port = format!("mock://{i}");
                DiscoveredDevice {
                    port: port.clone(),
                    sn: Some(format!("MOCK-{i:04}")),
                    driver: Arc::new(MockDriver::new(port)),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn spec(folder: PathBuf, params: Map<String, Value>) -> MeasurementSpec {
        MeasurementSpec {
            mode: "CV".into(),
            params,
            tia_gain: Some(0),
            sampling_interval: None,
            filename: "out.csv".into(),
            folder,
        }
    }

    #[tokio::test]
    async fn test_mock_writes_output_file() {
        let tmp = TempDir::new().unwrap();
        let driver = MockDriver::new("mock://0");
        driver
            .apply_measurement(spec(tmp.path().to_path_buf(), Map::new()))
            .await
            .unwrap();
        assert!(tmp.path().join("out.csv").is_file());
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_fail_parameter_propagates() {
        let tmp = TempDir::new().unwrap();
        let driver = MockDriver::new("mock://0");
        let mut params = Map::new();
        params.insert("mock_fail".into(), Value::String("bad contact".into()));
        let err = driver
            .apply_measurement(spec(tmp.path().to_path_buf(), params))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad contact"));
    }

    #[tokio::test]
    async fn test_abort_interrupts_long_measurement() {
        let tmp = TempDir::new().unwrap();
        let driver = Arc::new(MockDriver::new("mock://0"));
        let mut params = Map::new();
        params.insert("mock_duration_ms".into(), Value::from(60_000u64));

        let task = {
            let driver = Arc::clone(&driver);
            let spec = spec(tmp.path().to_path_buf(), params);
            tokio::spawn(async move { driver.apply_measurement(spec).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.request_abort().await, AbortOutcome::Requested);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
