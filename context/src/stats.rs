//! Run-level compaction statistics.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Compaction technique, least lossy first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Summarize a run of scenes inside the in-progress thread.
    Chunk,
    /// Summarize a completed thread into the cumulative summary.
    Thread,
    /// Strip `<thinking>` spans from older assistant turns.
    ThinkingTrim,
    /// Truncate long older assistant turns.
    Truncate,
}

impl Tier {
    #[must_use]
    pub const fn as_f32(self) -> f32 {
        match self {
            Tier::Chunk => 0.5,
            Tier::Thread => 1.0,
            Tier::ThinkingTrim => 3.0,
            Tier::Truncate => 4.0,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f32())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionStats {
    pub tier_activations: BTreeMap<Tier, u64>,
    pub total_compactions: u64,
    pub total_tokens_saved: u64,
    pub usage_samples: Vec<f64>,
}

impl CompactionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_compaction(&mut self, tier: Tier, tokens_before: u64, tokens_after: u64) {
        *self.tier_activations.entry(tier).or_insert(0) += 1;
        self.total_compactions += 1;
        self.total_tokens_saved += tokens_before.saturating_sub(tokens_after);
    }

    pub fn record_usage(&mut self, usage_percent: f64) {
        self.usage_samples.push(usage_percent);
    }

    #[must_use]
    pub fn avg_usage_percent(&self) -> f64 {
        if self.usage_samples.is_empty() {
            return 0.0;
        }
        self.usage_samples.iter().sum::<f64>() / self.usage_samples.len() as f64
    }

    #[must_use]
    pub fn max_usage_percent(&self) -> f64 {
        self.usage_samples.iter().copied().fold(0.0, f64::max)
    }

    #[must_use]
    pub fn activations(&self, tier: Tier) -> u64 {
        self.tier_activations.get(&tier).copied().unwrap_or(0)
    }

    /// One-line report for the end of a run.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Compactions: {} (T0.5={} T1={} T3={} T4={}) | Tokens saved: {} | Avg usage: {:.1}% | Max usage: {:.1}%",
            self.total_compactions,
            self.activations(Tier::Chunk),
            self.activations(Tier::Thread),
            self.activations(Tier::ThinkingTrim),
            self.activations(Tier::Truncate),
            self.total_tokens_saved,
            self.avg_usage_percent(),
            self.max_usage_percent(),
        )
    }
}
