//! Cost tracking and budget enforcement.
//!
//! One tracker per project run. Costs accumulate on every iteration and
//! finalize record; when a configured ceiling is crossed, the next
//! provider call fails with a distinguished [`ProviderError::BudgetExceeded`].

use std::sync::Mutex;

use crate::provider::ProviderError;

/// Accumulates LLM spend and enforces an optional budget
pub struct CostTracker {
    total_usd: Mutex<f64>,
    budget_usd: Option<f64>,
}

impl CostTracker {
    /// Tracker with no budget ceiling
    pub fn unlimited() -> Self {
        Self {
            total_usd: Mutex::new(0.0),
            budget_usd: None,
        }
    }

    /// Tracker with a hard ceiling in USD
    pub fn with_budget(budget_usd: f64) -> Self {
        Self {
            total_usd: Mutex::new(0.0),
            budget_usd: Some(budget_usd),
        }
    }

    /// Tracker from an optional config value
    pub fn from_config(budget_usd: Option<f64>) -> Self {
        Self {
            total_usd: Mutex::new(0.0),
            budget_usd,
        }
    }

    /// Record spend from one iteration or finalize
    pub fn record(&self, cost_usd: Option<f64>) {
        if let Some(cost) = cost_usd {
            let mut total = self.total_usd.lock().expect("cost tracker poisoned");
            *total += cost;
        }
    }

    /// Total recorded spend
    pub fn total(&self) -> f64 {
        *self.total_usd.lock().expect("cost tracker poisoned")
    }

    /// Configured ceiling, if any
    pub fn budget(&self) -> Option<f64> {
        self.budget_usd
    }

    /// Fail when the ceiling has been crossed; called before provider calls
    pub fn check_budget(&self) -> Result<(), ProviderError> {
        let current = self.total();
        match self.budget_usd {
            Some(limit) if current >= limit => Err(ProviderError::BudgetExceeded {
                limit_usd: limit,
                current_usd: current,
            }),
            _ => Ok(()),
        }
    }
}
