//! Synthetic `powermetrics` output for machines without the real binary.
//!
//! [`SimulatedSource`] emits text in the same block format `powermetrics`
//! prints, so it exercises exactly the same parser and pipeline as the real
//! subprocess. Rail levels come from a per-chip [`MockProfile`] and move
//! between idle and peak according to a [`LoadPattern`].

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reader::{SampleSource, SourceEvent};

/// Idle and peak power per rail for one simulated chip, in mW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockProfile {
    pub chip: String,
    pub ane_mw: (f64, f64),
    pub cpu_mw: (f64, f64),
    pub gpu_mw: (f64, f64),
}

/// `(chip, ane idle/peak, cpu idle/peak, gpu idle/peak)`
const MOCK_PROFILES: &[(&str, (f64, f64), (f64, f64), (f64, f64))] = &[
    ("M1", (0.0, 1800.0), (350.0, 4200.0), (20.0, 2800.0)),
    ("M2", (0.0, 2100.0), (320.0, 4600.0), (20.0, 3400.0)),
    ("M3", (0.0, 2400.0), (300.0, 5000.0), (15.0, 3900.0)),
    ("M4", (0.0, 2800.0), (280.0, 5400.0), (15.0, 4300.0)),
];

impl MockProfile {
    /// Profile for a chip family. Variants such as `"M2 Pro"` use their base
    /// family; unknown identifiers use M1 numbers under the given name.
    pub fn for_chip(chip: &str) -> Self {
        let upper = chip.trim().to_ascii_uppercase();
        let base = upper.split_whitespace().next().unwrap_or("");
        let &(_, ane, cpu, gpu) = MOCK_PROFILES
            .iter()
            .find(|(name, ..)| *name == base)
            .unwrap_or(&MOCK_PROFILES[0]);
        Self {
            chip: chip.trim().to_string(),
            ane_mw: ane,
            cpu_mw: cpu,
            gpu_mw: gpu,
        }
    }
}

/// How load varies from tick to tick. `level` 0.0 is idle, 1.0 is peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadPattern {
    Constant { level: f64 },
    /// Peak for the first `burst_ticks` of every `period_ticks`, idle otherwise.
    Burst { period_ticks: u32, burst_ticks: u32 },
    /// Alternating idle and peak runs of `half_period_ticks`.
    SquareWave { half_period_ticks: u32 },
}

impl Default for LoadPattern {
    fn default() -> Self {
        Self::Burst {
            period_ticks: 10,
            burst_ticks: 3,
        }
    }
}

impl LoadPattern {
    pub fn level(self, tick: u64) -> f64 {
        match self {
            Self::Constant { level } => level.clamp(0.0, 1.0),
            Self::Burst {
                period_ticks,
                burst_ticks,
            } => {
                let period = u64::from(period_ticks.max(1));
                if tick % period < u64::from(burst_ticks) {
                    1.0
                } else {
                    0.0
                }
            }
            Self::SquareWave { half_period_ticks } => {
                let half = u64::from(half_period_ticks.max(1));
                if (tick / half) % 2 == 1 { 1.0 } else { 0.0 }
            }
        }
    }
}

/// A [`SampleSource`] that fabricates `powermetrics` blocks.
pub struct SimulatedSource {
    name: String,
    profile: MockProfile,
    pattern: LoadPattern,
    interval: Duration,
    jitter: f64,
    rng: StdRng,
    tick: u64,
    limit: Option<u64>,
    realtime: bool,
    next_due: Option<Instant>,
    stopped: bool,
}

impl SimulatedSource {
    /// Real-time source: one block per `interval`, ±2% jitter.
    pub fn new(profile: MockProfile, pattern: LoadPattern, interval: Duration) -> Self {
        Self {
            name: format!("mock:{}", profile.chip),
            profile,
            pattern,
            interval,
            jitter: 0.02,
            rng: StdRng::from_os_rng(),
            tick: 0,
            limit: None,
            realtime: true,
            next_due: None,
            stopped: false,
        }
    }

    /// Fractional jitter applied to every rail value (0.0 disables).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// End with exit code 0 after `blocks` blocks.
    pub fn with_limit(mut self, blocks: u64) -> Self {
        self.limit = Some(blocks);
        self
    }

    /// Emit blocks as fast as they are requested instead of on the interval.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    fn rail(&mut self, (idle, peak): (f64, f64), level: f64) -> f64 {
        let base = idle + (peak - idle) * level;
        let noise = if self.jitter > 0.0 {
            1.0 + self.rng.random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        (base * noise).max(0.0)
    }

    /// Render the next block of `powermetrics` text.
    pub fn render_block(&mut self) -> String {
        let level = self.pattern.level(self.tick);
        let cpu = self.rail(self.profile.cpu_mw, level);
        let gpu = self.rail(self.profile.gpu_mw, level);
        let ane = self.rail(self.profile.ane_mw, level);
        let combined = cpu + gpu + ane;
        let elapsed = self.interval.as_secs_f64() * 1000.0;
        self.tick += 1;

        format!(
            "*** Sampled system activity (tick {tick}) ({elapsed:.2}ms elapsed) ***\n\
             \n\
             **** Processor usage ****\n\
             \n\
             E-Cluster HW active frequency: 1020 MHz\n\
             CPU Power: {cpu:.1} mW\n\
             GPU Power: {gpu:.1} mW\n\
             ANE Power: {ane:.1} mW\n\
             Combined Power (CPU + GPU + ANE): {combined:.1} mW\n\
             \n",
            tick = self.tick,
        )
    }
}

impl SampleSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent> {
        if self.stopped {
            return Ok(SourceEvent::Exited(None));
        }
        if let Some(limit) = self.limit
            && self.tick >= limit
        {
            return Ok(SourceEvent::Exited(Some(0)));
        }

        if self.realtime {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = (due - now).min(timeout);
                std::thread::sleep(wait);
                if Instant::now() < due {
                    return Ok(SourceEvent::Idle);
                }
            }
            self.next_due = Some(due + self.interval);
        }
        Ok(SourceEvent::Data(self.render_block().into_bytes()))
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}
