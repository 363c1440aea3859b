//! Agent core
//!
//! `AgentCore` is the per-agent owner of a budget, the condensation state and
//! the caps handed to live children. Every mutation goes through `&mut self`,
//! so each agent's budget and history are changed by one task at a time while
//! siblings run independently.

use crate::budget::escrow::{
    adjust_child_allocation, apply_release, release_allocation, spawn_child_budget,
};
use crate::budget::schema::add_committed;
use crate::budget::tracker::validate_budget_decrease;
use crate::budget::{
    ActionDecision, ActionKind, BudgetConfig, BudgetData, BudgetEnforcer, BudgetError,
    BudgetMode, BudgetSummary, BudgetTracker, Money, ReleaseOutcome, ReleasePolicy, SpendLedger,
};
use crate::condensation::{
    AgentState, CondensationEngine, CondensationOutcome, HistoryEntry, JsonFilePersistence,
    LlmReflector, ModelId, NoopPersistence, NullReflector, Reflector, StatePersistence,
};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::METRICS;
use indexmap::IndexMap;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators shared by every agent in a tree
#[derive(Clone)]
pub struct AgentDeps {
    pub tracker: BudgetTracker,
    pub enforcer: BudgetEnforcer,
    pub engine: Arc<CondensationEngine>,
    pub release_policy: ReleasePolicy,
}

impl AgentDeps {
    pub fn new(
        ledger: Arc<dyn SpendLedger>,
        engine: Arc<CondensationEngine>,
        budget: &BudgetConfig,
    ) -> Self {
        Self {
            tracker: BudgetTracker::new(ledger, budget.warning_threshold),
            enforcer: BudgetEnforcer::new(budget.min_action_cost),
            engine,
            release_policy: budget.release_policy,
        }
    }

    /// Wire up the reflector, persistence and engine described by `config`
    pub fn from_config(config: &Config, ledger: Arc<dyn SpendLedger>) -> Result<Self> {
        let reflector: Arc<dyn Reflector> = if config.reflector.enabled {
            Arc::new(LlmReflector::new(config.reflector.clone())?)
        } else {
            info!("Reflection disabled, condensation will only truncate");
            Arc::new(NullReflector)
        };

        let persistence: Arc<dyn StatePersistence> = match &config.state_dir {
            Some(dir) => Arc::new(JsonFilePersistence::new(dir.clone())),
            None => Arc::new(NoopPersistence),
        };

        let engine = CondensationEngine::new(config.condensation.clone(), reflector, persistence);
        Ok(Self::new(ledger, Arc::new(engine), &config.budget))
    }
}

impl std::fmt::Debug for AgentDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDeps")
            .field("tracker", &self.tracker)
            .field("enforcer", &self.enforcer)
            .field("release_policy", &self.release_policy)
            .finish_non_exhaustive()
    }
}

/// One agent's budget, context state and children
pub struct AgentCore {
    id: String,
    parent_id: Option<String>,
    budget: BudgetData,
    state: AgentState,
    /// Live children and the cap each was given (`None` = unconstrained)
    children: IndexMap<String, Option<Money>>,
    deps: AgentDeps,
}

impl AgentCore {
    /// Create a root agent
    pub fn root(id: impl Into<String>, cap: Option<Money>, deps: AgentDeps) -> Self {
        Self::with_budget(id.into(), None, BudgetData::root(cap), deps)
    }

    fn with_budget(
        id: String,
        parent_id: Option<String>,
        budget: BudgetData,
        deps: AgentDeps,
    ) -> Self {
        let state = AgentState::new(id.clone());
        Self {
            id,
            parent_id,
            budget,
            state,
            children: IndexMap::new(),
            deps,
        }
    }

    /// Restore an agent from persisted pieces
    pub fn restore(
        parent_id: Option<String>,
        budget: BudgetData,
        state: AgentState,
        deps: AgentDeps,
    ) -> Self {
        Self {
            id: state.agent_id.clone(),
            parent_id,
            budget,
            state,
            children: IndexMap::new(),
            deps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn budget(&self) -> &BudgetData {
        &self.budget
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn children(&self) -> &IndexMap<String, Option<Money>> {
        &self.children
    }

    pub async fn spent(&self) -> Result<Money> {
        Ok(self.deps.tracker.spent(&self.id).await?)
    }

    pub async fn budget_summary(&self) -> Result<BudgetSummary> {
        Ok(self.deps.tracker.summary(&self.id, &self.budget).await?)
    }

    /// Spawn a child, committing its cap from this agent's budget.
    ///
    /// On refusal nothing changes and the error says what was missing.
    pub async fn spawn_child(
        &mut self,
        child_id: Option<String>,
        cap: Option<Money>,
    ) -> Result<AgentCore> {
        let child_id = child_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let spent = self.spent().await?;

        let (parent, child_budget) = match spawn_child_budget(&self.budget, spent, cap) {
            Ok(budgets) => budgets,
            Err(e) => {
                METRICS.record_lock(false);
                warn!("{} refused to spawn {}: {}", self.id, child_id, e);
                return Err(e.into());
            }
        };

        METRICS.record_lock(true);
        self.budget = parent;
        self.children.insert(child_id.clone(), cap);
        info!(
            "{} spawned {} with budget {}",
            self.id,
            child_id,
            cap.map(|c| c.to_string()).unwrap_or_else(|| "na".to_string())
        );

        Ok(Self::with_budget(
            child_id,
            Some(self.id.clone()),
            child_budget,
            self.deps.clone(),
        ))
    }

    /// Dismiss a child and release its commitment
    pub async fn dismiss_child(&mut self, child_id: &str) -> Result<ReleaseOutcome> {
        let cap = *self
            .children
            .get(child_id)
            .ok_or_else(|| BudgetError::UnknownChild(child_id.to_string()))?;

        let outcome = match cap {
            Some(cap) => {
                let child_spent = self.deps.tracker.spent(child_id).await?;
                let released = release_allocation(&self.budget, cap, child_spent);
                let parent = apply_release(
                    &released.parent,
                    released.unspent,
                    self.deps.release_policy,
                );
                ReleaseOutcome {
                    parent,
                    unspent: released.unspent,
                }
            }
            None => ReleaseOutcome {
                parent: self.budget.clone(),
                unspent: Money::ZERO,
            },
        };

        self.children.shift_remove(child_id);
        self.budget = outcome.parent.clone();
        METRICS.budget_releases.inc();
        info!(
            "{} dismissed {}: {} unspent, committed now {}",
            self.id,
            child_id,
            outcome.unspent,
            self.budget.committed()
        );

        Ok(outcome)
    }

    /// Parent budget after moving `child_id` to `new_cap`, plus its old cap
    fn adjusted_budget(
        &self,
        child_id: &str,
        new_cap: Money,
        spent: Money,
    ) -> Result<(Money, BudgetData)> {
        let current = self
            .children
            .get(child_id)
            .copied()
            .ok_or_else(|| BudgetError::UnknownChild(child_id.to_string()))?
            .unwrap_or(Money::ZERO);

        match adjust_child_allocation(&self.budget, current, new_cap, spent) {
            Ok(parent) => Ok((current, parent)),
            Err(e) => {
                METRICS.record_adjustment(false);
                warn!("{} could not adjust {}: {}", self.id, child_id, e);
                Err(e.into())
            }
        }
    }

    /// Parent side of a cap change for a live child
    pub async fn adjust_child(&mut self, child_id: &str, new_cap: Money) -> Result<()> {
        let spent = self.spent().await?;
        let (current, parent) = self.adjusted_budget(child_id, new_cap, spent)?;
        self.commit_adjustment(child_id, current, new_cap, parent);
        Ok(())
    }

    fn commit_adjustment(
        &mut self,
        child_id: &str,
        current: Money,
        new_cap: Money,
        parent: BudgetData,
    ) {
        METRICS.record_adjustment(true);
        self.budget = parent;
        self.children.insert(child_id.to_string(), Some(new_cap));
        debug!("{} moved {} from {} to {}", self.id, child_id, current, new_cap);
    }

    /// This agent's budget under `new_cap`.
    ///
    /// An unconstrained agent committed nothing for the capped children it
    /// spawned; once capped it owes all of them, so `committed` becomes the
    /// sum of their caps. Uncapped children cannot live under a capped
    /// parent.
    fn reallocated_budget(&self, spent: Money, new_cap: Money) -> Result<BudgetData> {
        if new_cap.is_negative() {
            return Err(BudgetError::NegativeAmount(new_cap).into());
        }

        let budget = if self.budget.is_unconstrained() {
            if self.children.values().any(Option::is_none) {
                return Err(BudgetError::ChildBudgetRequired.into());
            }
            let owed: Money = self.children.values().flatten().copied().sum();
            let capped = match self.budget.mode() {
                BudgetMode::Root => BudgetData::root(Some(new_cap)),
                _ => BudgetData::allocated(new_cap),
            };
            add_committed(&capped, owed)
        } else {
            self.budget.with_allocated(new_cap)
        };

        validate_budget_decrease(&budget, spent, new_cap)?;
        Ok(budget)
    }

    /// Check that this agent can live with `new_cap`
    pub async fn validate_reallocation(&self, new_cap: Money) -> Result<()> {
        let spent = self.spent().await?;
        self.reallocated_budget(spent, new_cap).map(|_| ())
    }

    /// Child side of a cap change. An unconstrained agent becomes capped.
    pub async fn accept_reallocation(&mut self, new_cap: Money) -> Result<()> {
        let spent = self.spent().await?;
        self.budget = self.reallocated_budget(spent, new_cap)?;
        info!("{} budget is now {}", self.id, new_cap);
        Ok(())
    }

    /// Gate an action by name before it runs
    pub async fn gate_action(&self, action: &str, params: &Value) -> Result<ActionDecision> {
        let action = ActionKind::from_str(action)?;
        let spent = self.spent().await?;
        let decision = self
            .deps
            .enforcer
            .check_action(action, params, &self.budget, spent);
        METRICS.record_action(decision.is_allowed());
        Ok(decision)
    }

    /// Append an entry to a model's history
    pub fn record_entry(&mut self, model_id: &str, entry: HistoryEntry) {
        self.state.push_entry(model_id, entry);
    }

    /// Record a model response and honor any condense request it carries
    pub async fn after_model_response(
        &mut self,
        model_id: &str,
        raw_response: &str,
    ) -> CondensationOutcome {
        self.record_entry(model_id, HistoryEntry::assistant(raw_response));

        let state = std::mem::take(&mut self.state);
        let (state, outcome) = self
            .deps
            .engine
            .condense_from_response(state, model_id, raw_response)
            .await;
        self.state = state;
        outcome
    }

    /// Condense the `n` oldest entries of a model's history
    pub async fn condense(&mut self, model_id: &str, n: usize) -> CondensationOutcome {
        let state = std::mem::take(&mut self.state);
        let (state, outcome) = self.deps.engine.condense_requested(state, model_id, n).await;
        self.state = state;
        outcome
    }

    /// Token-overflow check across all models, run before each round
    pub async fn before_round(&mut self) -> Vec<(ModelId, CondensationOutcome)> {
        let state = std::mem::take(&mut self.state);
        let (state, outcomes) = self.deps.engine.condense_all_over_limit(state).await;
        self.state = state;
        outcomes
    }
}

/// Move a live child to `new_cap`, updating both sides or neither.
///
/// Each side's spend is read once and both new budgets are computed before
/// either agent is touched.
pub async fn reallocate(
    parent: &mut AgentCore,
    child: &mut AgentCore,
    new_cap: Money,
) -> Result<()> {
    if child.parent_id() != Some(parent.id()) {
        return Err(BudgetError::UnknownChild(child.id().to_string()).into());
    }

    let child_spent = child.spent().await?;
    let parent_spent = parent.spent().await?;

    let child_budget = child.reallocated_budget(child_spent, new_cap)?;
    let (current, parent_budget) = parent.adjusted_budget(child.id(), new_cap, parent_spent)?;

    parent.commit_adjustment(child.id(), current, new_cap, parent_budget);
    child.budget = child_budget;
    info!("{} budget is now {}", child.id, new_cap);
    Ok(())
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("budget", &self.budget)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
