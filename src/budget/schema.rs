//! Canonical budget representation
//!
//! A `BudgetData` is owned by exactly one agent. Only the escrow functions and
//! explicit reallocation produce modified copies of it; `spent` is never
//! stored here, it always comes from the spend ledger.

use super::money::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How a budget obtained its cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetMode {
    /// Top of the tree, may or may not carry a cap
    Root,
    /// Cap assigned by a parent
    Allocated,
    /// No cap at all ("N/A")
    Unconstrained,
}

impl BudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Allocated => "allocated",
            Self::Unconstrained => "na",
        }
    }
}

impl fmt::Display for BudgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "root" => Ok(Self::Root),
            "allocated" => Ok(Self::Allocated),
            "na" | "n/a" | "unconstrained" => Ok(Self::Unconstrained),
            other => Err(SchemaError::UnknownMode(other.to_string())),
        }
    }
}

/// Budget schema errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Unknown budget mode: {0}")]
    UnknownMode(String),

    #[error("Committed amount cannot be negative: {0}")]
    NegativeCommitted(Money),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(String),
}

/// Per-agent budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PersistedBudget", into = "PersistedBudget")]
pub struct BudgetData {
    mode: BudgetMode,
    allocated: Option<Money>,
    committed: Money,
}

/// Flat persisted form of a budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBudget {
    pub mode: String,
    #[serde(default)]
    pub allocated: Option<Money>,
    #[serde(default)]
    pub committed: Money,
}

impl BudgetData {
    /// Root budget, capped or not
    pub fn root(cap: Option<Money>) -> Self {
        Self {
            mode: BudgetMode::Root,
            allocated: cap,
            committed: Money::ZERO,
        }
    }

    /// Budget carved out of a parent's allocation
    pub fn allocated(cap: Money) -> Self {
        Self {
            mode: BudgetMode::Allocated,
            allocated: Some(cap),
            committed: Money::ZERO,
        }
    }

    pub fn unconstrained() -> Self {
        Self {
            mode: BudgetMode::Unconstrained,
            allocated: None,
            committed: Money::ZERO,
        }
    }

    pub fn mode(&self) -> BudgetMode {
        self.mode
    }

    pub fn allocated_amount(&self) -> Option<Money> {
        self.allocated
    }

    pub fn committed(&self) -> Money {
        self.committed
    }

    /// A missing cap means unconstrained regardless of mode
    pub fn is_unconstrained(&self) -> bool {
        self.allocated.is_none()
    }

    /// Copy with a different cap; mode and commitments are kept
    pub fn with_allocated(&self, cap: Money) -> Self {
        Self {
            allocated: Some(cap),
            ..self.clone()
        }
    }

    pub fn to_persisted(&self) -> PersistedBudget {
        PersistedBudget {
            mode: self.mode.as_str().to_string(),
            allocated: self.allocated,
            committed: self.committed,
        }
    }

    pub fn from_persisted(persisted: PersistedBudget) -> Result<Self, SchemaError> {
        let mode = persisted.mode.parse()?;
        if persisted.committed.is_negative() {
            return Err(SchemaError::NegativeCommitted(persisted.committed));
        }
        Ok(Self {
            mode,
            allocated: persisted.allocated,
            committed: persisted.committed,
        })
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).map_err(|e| SchemaError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(|e| SchemaError::Deserialization(e.to_string()))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, SchemaError> {
        rmp_serde::to_vec_named(self).map_err(|e| SchemaError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, SchemaError> {
        rmp_serde::from_slice(bytes).map_err(|e| SchemaError::Deserialization(e.to_string()))
    }
}

impl From<BudgetData> for PersistedBudget {
    fn from(budget: BudgetData) -> Self {
        budget.to_persisted()
    }
}

impl TryFrom<PersistedBudget> for BudgetData {
    type Error = SchemaError;

    fn try_from(persisted: PersistedBudget) -> Result<Self, Self::Error> {
        Self::from_persisted(persisted)
    }
}

/// Add to `committed`. Negative amounts are ignored.
pub fn add_committed(budget: &BudgetData, amount: Money) -> BudgetData {
    BudgetData {
        committed: budget.committed + amount.non_negative(),
        ..budget.clone()
    }
}

/// Subtract from `committed`, clamping at zero
pub fn release_committed(budget: &BudgetData, amount: Money) -> BudgetData {
    BudgetData {
        committed: (budget.committed - amount.non_negative()).non_negative(),
        ..budget.clone()
    }
}
