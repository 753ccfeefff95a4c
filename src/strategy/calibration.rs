use std::collections::HashMap;
use std::sync::Mutex;

pub const W_AI_MAX: f64 = 0.35;
pub const N_RESOLVED_MIN: usize = 50;

/// Trust gate for the AI probability: until a category has enough resolved
/// outcomes behind it, the AI weight is zero and `p_eff` collapses to
/// `p_market`.
#[derive(Debug, Default)]
pub struct CalibrationTracker {
    resolved_by_category: Mutex<HashMap<String, usize>>,
}

impl CalibrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resolved(&self, category: &str) {
        *self
            .resolved_by_category
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(category.to_string())
            .or_default() += 1;
    }

    pub fn resolved_count(&self, category: &str) -> usize {
        self.resolved_by_category
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(category)
            .copied()
            .unwrap_or(0)
    }

    /// AI influence weight for a category, clamped to the configured cap.
    pub fn w_ai(&self, category: &str, w_ai_cap: f64) -> f64 {
        if self.resolved_count(category) < N_RESOLVED_MIN {
            0.0
        } else {
            w_ai_cap.clamp(0.0, W_AI_MAX)
        }
    }
}
