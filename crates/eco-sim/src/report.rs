//! JSON report written at the end of a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use eco_core::{PopulationSample, SimulationConfig};
use eco_world::RunSummary;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: SimulationConfig,
    pub summary: RunSummary,
    /// Rolling population log, oldest first
    pub samples: Vec<PopulationSample>,
}

impl RunReport {
    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))
    }
}
