//! Power samples and the bounded windows statistics are computed over.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rail
// ---------------------------------------------------------------------------

/// A power rail reported by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    /// Apple Neural Engine.
    Ane,
    Cpu,
    Gpu,
    /// Whole-package total (CPU + GPU + ANE).
    Package,
}

impl Rail {
    /// The component rails, excluding the package total.
    pub const COMPONENTS: [Rail; 3] = [Rail::Ane, Rail::Cpu, Rail::Gpu];
    pub const ALL: [Rail; 4] = [Rail::Ane, Rail::Cpu, Rail::Gpu, Rail::Package];

    /// CSV column name for this rail.
    pub fn column(self) -> &'static str {
        match self {
            Self::Ane => "ane_mw",
            Self::Cpu => "cpu_mw",
            Self::Gpu => "gpu_mw",
            Self::Package => "package_mw",
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ane => write!(f, "ane"),
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
            Self::Package => write!(f, "package"),
        }
    }
}

impl std::str::FromStr for Rail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ane" => Ok(Self::Ane),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "package" | "combined" | "pkg" => Ok(Self::Package),
            other => Err(format!("unknown rail '{other}' (expected ane, cpu, gpu or package)")),
        }
    }
}

// ---------------------------------------------------------------------------
// PowerSample
// ---------------------------------------------------------------------------

/// One measurement tick. Absent rails are `None`, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSample {
    /// Monotonic seconds since the process epoch (see [`crate::clock`]).
    pub timestamp: f64,
    pub ane_mw: Option<f64>,
    pub cpu_mw: Option<f64>,
    pub gpu_mw: Option<f64>,
    pub package_mw: Option<f64>,
}

/// Why a parsed sample was discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleRejection {
    /// No rail was present at all.
    Empty,
    /// A rail reported a negative or non-finite value.
    InvalidValue { rail: Rail, value: f64 },
    /// The package total is smaller than one of its components.
    PackageBelowComponent { rail: Rail, component_mw: f64, package_mw: f64 },
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "no rails present"),
            Self::InvalidValue { rail, value } => write!(f, "{rail} reported {value}"),
            Self::PackageBelowComponent {
                rail,
                component_mw,
                package_mw,
            } => write!(f, "package {package_mw} mW below {rail} {component_mw} mW"),
        }
    }
}

impl PowerSample {
    /// Build a sample with only the timestamp set.
    pub fn at(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn get(&self, rail: Rail) -> Option<f64> {
        match rail {
            Rail::Ane => self.ane_mw,
            Rail::Cpu => self.cpu_mw,
            Rail::Gpu => self.gpu_mw,
            Rail::Package => self.package_mw,
        }
    }

    pub fn set(&mut self, rail: Rail, value: Option<f64>) {
        match rail {
            Rail::Ane => self.ane_mw = value,
            Rail::Cpu => self.cpu_mw = value,
            Rail::Gpu => self.gpu_mw = value,
            Rail::Package => self.package_mw = value,
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, rail: Rail, value_mw: f64) -> Self {
        self.set(rail, Some(value_mw));
        self
    }

    pub fn is_empty(&self) -> bool {
        Rail::ALL.iter().all(|&r| self.get(r).is_none())
    }

    /// Values are finite and non-negative, and
    /// the package total dominates every component when all are present.
    pub fn validate(&self) -> Result<(), SampleRejection> {
        if self.is_empty() {
            return Err(SampleRejection::Empty);
        }
        for rail in Rail::ALL {
            if let Some(v) = self.get(rail)
                && (!v.is_finite() || v < 0.0)
            {
                return Err(SampleRejection::InvalidValue { rail, value: v });
            }
        }

        let all_present = Rail::ALL.iter().all(|&r| self.get(r).is_some());
        if all_present && let Some(package_mw) = self.package_mw {
            for rail in Rail::COMPONENTS {
                let component_mw = self.get(rail).unwrap_or(0.0);
                if component_mw > package_mw {
                    return Err(SampleRejection::PackageBelowComponent {
                        rail,
                        component_mw,
                        package_mw,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SampleWindow
// ---------------------------------------------------------------------------

/// Fixed-capacity ring of samples in capture order. The oldest sample is
/// evicted when a push would exceed capacity.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    capacity: usize,
    samples: VecDeque<PowerSample>,
}

impl SampleWindow {
    /// Create a window. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample. Samples older than the newest one already held are
    /// refused so insertion order always matches time order.
    pub fn push(&mut self, sample: PowerSample) -> bool {
        if let Some(last) = self.samples.back()
            && sample.timestamp < last.timestamp
        {
            return false;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn extend<I: IntoIterator<Item = PowerSample>>(&mut self, samples: I) {
        for s in samples {
            self.push(s);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&PowerSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PowerSample> {
        self.samples.iter()
    }

    /// Present values of one rail, oldest first. Absent readings are skipped.
    pub fn values(&self, rail: Rail) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.get(rail)).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
