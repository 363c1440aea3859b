//! Hierarchical budget escrow
//!
//! Every agent owns one `BudgetData`. A parent reserves (commits) part of its
//! own budget when it spawns a child, and gives the reservation back when the
//! child is dismissed. All functions here are pure transforms over budgets;
//! money actually consumed is only ever read from a `SpendLedger`.

pub mod enforcer;
pub mod escrow;
pub mod money;
pub mod schema;
pub mod tracker;

pub use enforcer::{
    ActionCost, ActionDecision, ActionKind, BlockReason, BudgetEnforcer, UnknownAction,
};
pub use escrow::{ReleaseOutcome, ReleasePolicy};
pub use money::Money;
pub use schema::{BudgetData, BudgetMode, PersistedBudget, SchemaError};
pub use tracker::{
    BudgetStatus, BudgetSummary, BudgetTracker, InMemoryLedger, LedgerError, SpendLedger,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Budget errors. These are values returned to the owning agent, which can
/// always recover (refuse a spawn, block an action).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("Insufficient budget: need {required}, have {available}")]
    InsufficientBudget { required: Money, available: Money },

    #[error("Insufficient parent budget: need {required}, have {available}")]
    InsufficientParentBudget { required: Money, available: Money },

    #[error("Over budget: action {action} needs {required}")]
    OverBudget { action: String, required: Money },

    #[error("Cannot decrease budget to {requested}: {spent} spent and {committed} committed")]
    DecreaseBelowObligations {
        requested: Money,
        spent: Money,
        committed: Money,
    },

    #[error("Amount cannot be negative: {0}")]
    NegativeAmount(Money),

    #[error("A capped parent cannot spawn a child without a budget")]
    ChildBudgetRequired,

    #[error("Unknown child: {0}")]
    UnknownChild(String),
}

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Cap for root agents; `None` runs the root unconstrained
    #[serde(default)]
    pub root_budget: Option<Money>,

    /// Available amounts below this are reported as `warning`
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: Money,

    /// Amount a costly action needs when it does not name its own cost
    #[serde(default = "default_min_action_cost")]
    pub min_action_cost: Money,

    /// What happens to unspent money when a child is dismissed
    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

fn default_warning_threshold() -> Money {
    Money::from_units(1)
}

fn default_min_action_cost() -> Money {
    Money::from_cents(1)
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            root_budget: None,
            warning_threshold: default_warning_threshold(),
            min_action_cost: default_min_action_cost(),
            release_policy: ReleasePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BudgetConfig::default();
        assert_eq!(config.root_budget, None);
        assert_eq!(config.warning_threshold, Money::from_units(1));
        assert_eq!(config.min_action_cost, Money::from_cents(1));
        assert_eq!(config.release_policy, ReleasePolicy::CommittedOnly);
    }

    #[test]
    fn test_config_from_json() {
        let config: BudgetConfig = serde_json::from_str(
            r#"{"root_budget": "250.00", "warning_threshold": 5, "release_policy": "credit_unspent"}"#,
        )
        .unwrap();
        assert_eq!(config.root_budget, Some(Money::from_units(250)));
        assert_eq!(config.warning_threshold, Money::from_units(5));
        assert_eq!(config.release_policy, ReleasePolicy::CreditUnspent);
    }
}
