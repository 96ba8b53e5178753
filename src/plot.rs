//! Plot rendering seam.
//!
//! Rendering figures from measurement output is stateless post-processing and
//! lives behind this trait; the orchestration engine only decides *when* to
//! render (after each successful mode, when the job asked for plots) and
//! treats renderer failures as non-fatal.

use anyhow::Result;
use serde_json::{Map, Value};
use std::path::Path;

/// Renders a figure next to a measurement output file.
pub trait PlotRenderer: Send + Sync {
    /// Render a plot for `csv_path`. Implementations write their artifact
    /// into the same directory (conventionally `<csv stem>.png`).
    fn render(&self, csv_path: &Path, mode: &str, params: &Map<String, Value>) -> Result<()>;
}

/// Renderer used when no plotting backend is wired in; does nothing.
#[derive(Default)]
pub struct NoopPlotRenderer;

impl PlotRenderer for NoopPlotRenderer {
    fn render(&self, _csv_path: &Path, _mode: &str, _params: &Map<String, Value>) -> Result<()> {
        Ok(())
    }
}
