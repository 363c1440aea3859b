//! Parent/child allocation protocol
//!
//! A parent commits funds when a child is spawned, releases them when the
//! child is dismissed and re-commits the difference when a child's cap is
//! adjusted. The parent only ever touches its own `committed`; the child's
//! budget is a separate value owned by the child.

use super::money::Money;
use super::schema::{add_committed, release_committed, BudgetData};
use super::tracker::{calculate_available, has_available};
use super::BudgetError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What to do with a dismissed child's unspent money beyond dropping the
/// commitment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Only `committed` is reduced; the parent's cap is unchanged
    #[default]
    CommittedOnly,
    /// The unspent amount is also added to the parent's cap
    CreditUnspent,
}

/// Result of releasing a child's allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub parent: BudgetData,
    /// `child_allocated - child_spent`, never negative
    pub unspent: Money,
}

fn ensure_non_negative(amount: Money) -> Result<(), BudgetError> {
    if amount.is_negative() {
        return Err(BudgetError::NegativeAmount(amount));
    }
    Ok(())
}

/// Check that a parent can fund `amount` for a new child
pub fn validate_allocation(
    parent: &BudgetData,
    parent_spent: Money,
    amount: Money,
) -> Result<(), BudgetError> {
    ensure_non_negative(amount)?;

    if parent.is_unconstrained() || has_available(parent, parent_spent, amount) {
        return Ok(());
    }

    Err(BudgetError::InsufficientBudget {
        required: amount,
        available: calculate_available(parent, parent_spent).unwrap_or(Money::ZERO),
    })
}

/// Commit `amount` of the parent's budget to a child
pub fn lock_allocation(
    parent: &BudgetData,
    parent_spent: Money,
    amount: Money,
) -> Result<BudgetData, BudgetError> {
    ensure_non_negative(amount)?;

    if parent.is_unconstrained() {
        debug!("Parent is unconstrained, nothing to lock for {}", amount);
        return Ok(parent.clone());
    }

    validate_allocation(parent, parent_spent, amount)?;
    let locked = add_committed(parent, amount);

    info!(
        "Locked {} for child: committed {} -> {}",
        amount,
        parent.committed(),
        locked.committed()
    );

    Ok(locked)
}

/// Drop the commitment for a dismissed child and report what it left unspent
pub fn release_allocation(
    parent: &BudgetData,
    child_allocated: Money,
    child_spent: Money,
) -> ReleaseOutcome {
    let unspent = (child_allocated - child_spent).non_negative();
    let released = release_committed(parent, child_allocated);

    info!(
        "Released child allocation {} (spent {}, unspent {}): committed {} -> {}",
        child_allocated,
        child_spent,
        unspent,
        parent.committed(),
        released.committed()
    );

    ReleaseOutcome {
        parent: released,
        unspent,
    }
}

/// Apply the configured release policy to a parent after `release_allocation`
pub fn apply_release(parent: &BudgetData, unspent: Money, policy: ReleasePolicy) -> BudgetData {
    match (policy, parent.allocated_amount()) {
        (ReleasePolicy::CreditUnspent, Some(allocated)) if unspent.is_positive() => {
            debug!("Crediting {} back to parent cap {}", unspent, allocated);
            parent.with_allocated(allocated + unspent)
        }
        _ => parent.clone(),
    }
}

/// Move a child's cap from `current_child_allocated` to `new_child_allocated`.
/// Increases must be fundable by the parent; decreases always succeed.
pub fn adjust_child_allocation(
    parent: &BudgetData,
    current_child_allocated: Money,
    new_child_allocated: Money,
    parent_spent: Money,
) -> Result<BudgetData, BudgetError> {
    ensure_non_negative(new_child_allocated)?;

    if parent.is_unconstrained() {
        return Ok(parent.clone());
    }

    let delta = new_child_allocated - current_child_allocated;

    if delta.is_zero() {
        Ok(parent.clone())
    } else if delta.is_positive() {
        if !has_available(parent, parent_spent, delta) {
            return Err(BudgetError::InsufficientParentBudget {
                required: delta,
                available: calculate_available(parent, parent_spent).unwrap_or(Money::ZERO),
            });
        }
        info!("Increasing child allocation by {}", delta);
        Ok(add_committed(parent, delta))
    } else {
        info!("Decreasing child allocation by {}", delta.abs());
        Ok(release_committed(parent, delta.abs()))
    }
}

/// Budgets for a parent and a newly spawned child.
///
/// A capped parent must give the child a cap. An unconstrained parent may
/// spawn either kind; a capped child of an unconstrained parent commits
/// nothing on the parent side.
pub fn spawn_child_budget(
    parent: &BudgetData,
    parent_spent: Money,
    child_cap: Option<Money>,
) -> Result<(BudgetData, BudgetData), BudgetError> {
    match child_cap {
        Some(cap) => {
            let parent = lock_allocation(parent, parent_spent, cap)?;
            Ok((parent, BudgetData::allocated(cap)))
        }
        None if parent.is_unconstrained() => Ok((parent.clone(), BudgetData::unconstrained())),
        None => Err(BudgetError::ChildBudgetRequired),
    }
}
