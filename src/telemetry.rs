//! Rolling metrics built from parsed TPS reports and sampler readings.

use crate::sampler::ResourceReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

pub const TPS_GOOD: f64 = 19.5;
pub const TPS_DEGRADED: f64 = 18.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_memory_percent: Option<f64>,
}

impl MetricSample {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            tps: None,
            cpu_percent: None,
            server_memory_bytes: None,
            system_memory_percent: None,
        }
    }

    pub fn tps_band(&self) -> TpsBand {
        TpsBand::from_tps(self.tps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpsBand {
    Good,
    Degraded,
    Poor,
    Unknown,
}

impl TpsBand {
    pub fn from_tps(tps: Option<f64>) -> Self {
        match tps {
            None => TpsBand::Unknown,
            Some(t) if t >= TPS_GOOD => TpsBand::Good,
            Some(t) if t >= TPS_DEGRADED => TpsBand::Degraded,
            Some(_) => TpsBand::Poor,
        }
    }
}

impl std::fmt::Display for TpsBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TpsBand::Good => write!(f, "good"),
            TpsBand::Degraded => write!(f, "degraded"),
            TpsBand::Poor => write!(f, "poor"),
            TpsBand::Unknown => write!(f, "unknown"),
        }
    }
}

/// Most recent `capacity` samples, oldest first.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn from_samples(capacity: usize, samples: Vec<MetricSample>) -> Self {
        let mut history = Self::new(capacity);
        let skip = samples.len().saturating_sub(history.capacity);
        history.samples.extend(samples.into_iter().skip(skip));
        history
    }

    pub fn push(&mut self, sample: MetricSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn average_tps(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.tps))
    }

    pub fn average_cpu(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.cpu_percent))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Per-run telemetry state plus the retained history.
#[derive(Debug)]
pub struct TelemetryAggregator {
    history: MetricsHistory,
    last_tps: Option<f64>,
    players: BTreeSet<String>,
    dirty: bool,
}

impl TelemetryAggregator {
    pub fn new(history: MetricsHistory) -> Self {
        Self {
            history,
            last_tps: None,
            players: BTreeSet::new(),
            dirty: false,
        }
    }

    /// Forget what the previous run reported. History is kept.
    pub fn reset_run(&mut self) {
        self.last_tps = None;
        self.players.clear();
    }

    pub fn record_tps(&mut self, tps: f64) {
        self.last_tps = Some(tps);
    }

    /// Build one sample from the latest TPS and a sampler result, then
    /// append it. `None` means the sampler missed this tick.
    pub fn record_tick(&mut self, reading: Option<ResourceReading>) -> MetricSample {
        let sample = MetricSample {
            timestamp: Utc::now(),
            tps: self.last_tps,
            cpu_percent: reading.and_then(|r| r.cpu_percent),
            server_memory_bytes: reading.map(|r| r.memory_bytes),
            system_memory_percent: reading.map(|r| r.system_memory_percent),
        };
        self.history.push(sample.clone());
        self.dirty = true;
        sample
    }

    pub fn player_joined(&mut self, name: String) {
        self.players.insert(name);
    }

    pub fn player_left(&mut self, name: &str) {
        self.players.remove(name);
    }

    pub fn players(&self) -> Vec<String> {
        self.players.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricSample> {
        self.history.latest().cloned()
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    /// Snapshot for persistence if anything changed since the last call.
    pub fn take_dirty(&mut self) -> Option<Vec<MetricSample>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.history.snapshot())
    }
}
