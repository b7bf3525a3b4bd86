//! Aggregate configuration.
//!
//! Every section has a `Default` and every struct is `#[serde(default)]`, so a
//! JSON file only needs to name what it changes:
//!
//! ```json
//! { "baseline": { "high_baseline_mw": 1800 }, "analyzer": { "window_capacity": 100 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::AnalyzerConfig;
use crate::baseline::{BaselineConfig, StabilizationConfig};
use crate::error::{PowerError, Result};
use crate::parser::ParserConfig;
use crate::reader::ReaderConfig;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PowertapConfig {
    pub parser: ParserConfig,
    pub reader: ReaderConfig,
    pub analyzer: AnalyzerConfig,
    pub baseline: BaselineConfig,
    pub stabilization: StabilizationConfig,
    pub session: SessionConfig,
}

impl PowertapConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| PowerError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.parser.overlap_bytes > self.parser.max_buffer_bytes {
            return Err(PowerError::Config(
                "parser.overlap_bytes must not exceed parser.max_buffer_bytes".into(),
            ));
        }
        if self.reader.interval_ms == 0 {
            return Err(PowerError::Config("reader.interval_ms must be positive".into()));
        }
        if self.baseline.wasted_util_pct > self.baseline.legitimate_util_pct {
            return Err(PowerError::Config(
                "baseline.wasted_util_pct must not exceed baseline.legitimate_util_pct".into(),
            ));
        }
        for (rail, a) in &self.analyzer.anchors {
            if !(a.low_mw.is_finite() && a.high_mw.is_finite()) {
                return Err(PowerError::Config(format!("analyzer.anchors.{rail} is not finite")));
            }
        }
        Ok(())
    }
}
