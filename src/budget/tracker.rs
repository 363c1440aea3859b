//! Read-only budget calculations over (budget, spent)
//!
//! `spent` always comes from a `SpendLedger`. Nothing here mutates a budget.

use super::money::Money;
use super::schema::BudgetData;
use super::BudgetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Budget health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Warning,
    OverBudget,
    /// Unconstrained budget
    Na,
}

/// Spend ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid cost record: {0}")]
    InvalidRecord(String),
}

/// Shared, append-only record of money actually consumed
#[async_trait]
pub trait SpendLedger: Send + Sync {
    /// Total recorded spend for an agent
    async fn get_spent(&self, agent_id: &str) -> Result<Money, LedgerError>;
}

/// Single recorded cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub agent_id: String,
    pub amount: Money,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

/// In-process ledger keyed by agent id
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: DashMap<String, Vec<CostRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cost record
    pub fn record(
        &self,
        agent_id: &str,
        amount: Money,
        description: impl Into<String>,
    ) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidRecord(format!(
                "negative cost {} for {}",
                amount, agent_id
            )));
        }

        self.records
            .entry(agent_id.to_string())
            .or_default()
            .push(CostRecord {
                agent_id: agent_id.to_string(),
                amount,
                description: description.into(),
                recorded_at: Utc::now(),
            });
        Ok(())
    }

    pub fn records(&self, agent_id: &str) -> Vec<CostRecord> {
        self.records
            .get(agent_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SpendLedger for InMemoryLedger {
    async fn get_spent(&self, agent_id: &str) -> Result<Money, LedgerError> {
        Ok(self
            .records
            .get(agent_id)
            .map(|records| records.iter().map(|r| r.amount).sum())
            .unwrap_or(Money::ZERO))
    }
}

/// Query the ledger for an agent's total spend
pub async fn get_spent(ledger: &dyn SpendLedger, agent_id: &str) -> Result<Money, LedgerError> {
    let spent = ledger.get_spent(agent_id).await?;
    debug!("Spent for {}: {}", agent_id, spent);
    Ok(spent)
}

/// `allocated - spent - committed`, or `None` when unconstrained. May be negative.
pub fn calculate_available(budget: &BudgetData, spent: Money) -> Option<Money> {
    budget
        .allocated_amount()
        .map(|allocated| allocated - spent - budget.committed())
}

/// Classify budget health against a low-balance threshold
pub fn get_status(budget: &BudgetData, spent: Money, warning_threshold: Money) -> BudgetStatus {
    match calculate_available(budget, spent) {
        None => BudgetStatus::Na,
        Some(available) if !available.is_positive() => BudgetStatus::OverBudget,
        Some(available) if available < warning_threshold => BudgetStatus::Warning,
        Some(_) => BudgetStatus::Ok,
    }
}

/// True when unconstrained or `available >= required`
pub fn has_available(budget: &BudgetData, spent: Money, required: Money) -> bool {
    match calculate_available(budget, spent) {
        None => true,
        Some(available) => available >= required,
    }
}

/// Reject shrinking a cap below money already spent or committed
pub fn validate_budget_decrease(
    budget: &BudgetData,
    spent: Money,
    new_allocated: Money,
) -> Result<(), BudgetError> {
    let obligated = spent + budget.committed();
    if new_allocated < obligated {
        return Err(BudgetError::DecreaseBelowObligations {
            requested: new_allocated,
            spent,
            committed: budget.committed(),
        });
    }
    Ok(())
}

/// Point-in-time view of a budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub mode: String,
    pub allocated: Option<Money>,
    pub spent: Money,
    pub committed: Money,
    pub available: Option<Money>,
    pub status: BudgetStatus,
}

/// Ledger-backed tracker with a configured low-balance threshold
#[derive(Clone)]
pub struct BudgetTracker {
    ledger: Arc<dyn SpendLedger>,
    warning_threshold: Money,
}

impl BudgetTracker {
    pub fn new(ledger: Arc<dyn SpendLedger>, warning_threshold: Money) -> Self {
        Self {
            ledger,
            warning_threshold,
        }
    }

    pub async fn spent(&self, agent_id: &str) -> Result<Money, LedgerError> {
        get_spent(self.ledger.as_ref(), agent_id).await
    }

    pub fn status(&self, budget: &BudgetData, spent: Money) -> BudgetStatus {
        get_status(budget, spent, self.warning_threshold)
    }

    /// Snapshot of a budget with spend fetched from the ledger
    pub async fn summary(
        &self,
        agent_id: &str,
        budget: &BudgetData,
    ) -> Result<BudgetSummary, LedgerError> {
        let spent = self.spent(agent_id).await?;
        Ok(BudgetSummary {
            mode: budget.mode().to_string(),
            allocated: budget.allocated_amount(),
            spent,
            committed: budget.committed(),
            available: calculate_available(budget, spent),
            status: self.status(budget, spent),
        })
    }

    pub fn warning_threshold(&self) -> Money {
        self.warning_threshold
    }

    pub fn ledger(&self) -> &Arc<dyn SpendLedger> {
        &self.ledger
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("warning_threshold", &self.warning_threshold)
            .finish_non_exhaustive()
    }
}
