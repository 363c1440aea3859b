//! Per-action budget gate

use super::money::Money;
use super::schema::BudgetData;
use super::tracker::has_available;
use super::BudgetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Actions an agent can take in a consensus round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SpawnChild,
    DismissChild,
    AdjustBudget,
    SendMessage,
    Wait,
    Orient,
    Todo,
    ExecuteShell,
    FetchWeb,
    CallApi,
    CallMcp,
    AnswerEngine,
    GenerateImages,
    FileRead,
    FileWrite,
    LearnSkills,
    CreateSkill,
    GenerateSecret,
    SearchSecrets,
}

impl ActionKind {
    pub const ALL: [ActionKind; 19] = [
        Self::SpawnChild,
        Self::DismissChild,
        Self::AdjustBudget,
        Self::SendMessage,
        Self::Wait,
        Self::Orient,
        Self::Todo,
        Self::ExecuteShell,
        Self::FetchWeb,
        Self::CallApi,
        Self::CallMcp,
        Self::AnswerEngine,
        Self::GenerateImages,
        Self::FileRead,
        Self::FileWrite,
        Self::LearnSkills,
        Self::CreateSkill,
        Self::GenerateSecret,
        Self::SearchSecrets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnChild => "spawn_child",
            Self::DismissChild => "dismiss_child",
            Self::AdjustBudget => "adjust_budget",
            Self::SendMessage => "send_message",
            Self::Wait => "wait",
            Self::Orient => "orient",
            Self::Todo => "todo",
            Self::ExecuteShell => "execute_shell",
            Self::FetchWeb => "fetch_web",
            Self::CallApi => "call_api",
            Self::CallMcp => "call_mcp",
            Self::AnswerEngine => "answer_engine",
            Self::GenerateImages => "generate_images",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::LearnSkills => "learn_skills",
            Self::CreateSkill => "create_skill",
            Self::GenerateSecret => "generate_secret",
            Self::SearchSecrets => "search_secrets",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Action identifier that is not part of the closed action set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

/// Whether an action consumes budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCost {
    Costly,
    Free,
}

/// Why an action was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    OverBudget,
    /// The action named an amount that could not be read
    InvalidAmount,
}

/// Gate verdict for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ActionDecision {
    Allowed,
    Blocked { reason: BlockReason, required: Money },
}

impl ActionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Map a block to `BudgetError::OverBudget` for callers that use `?`
    pub fn into_result(self, action: ActionKind) -> Result<(), BudgetError> {
        match self {
            Self::Allowed => Ok(()),
            Self::Blocked { required, .. } => Err(BudgetError::OverBudget {
                action: action.to_string(),
                required,
            }),
        }
    }
}

/// Classify an action. Actions that buy model, search or image time cost
/// money; coordination and local actions are free.
pub fn classify_action(action: ActionKind, _params: &Value) -> ActionCost {
    match action {
        ActionKind::SpawnChild
        | ActionKind::CallApi
        | ActionKind::CallMcp
        | ActionKind::AnswerEngine
        | ActionKind::GenerateImages => ActionCost::Costly,
        ActionKind::DismissChild
        | ActionKind::AdjustBudget
        | ActionKind::SendMessage
        | ActionKind::Wait
        | ActionKind::Orient
        | ActionKind::Todo
        | ActionKind::ExecuteShell
        | ActionKind::FetchWeb
        | ActionKind::FileRead
        | ActionKind::FileWrite
        | ActionKind::LearnSkills
        | ActionKind::CreateSkill
        | ActionKind::GenerateSecret
        | ActionKind::SearchSecrets => ActionCost::Free,
    }
}

/// Read a `budget` amount from action params. `Ok(None)` when absent.
fn budget_param(params: &Value) -> Result<Option<Money>, serde_json::Error> {
    match params.get("budget") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value::<Money>(value.clone()).map(Some),
    }
}

/// Gate that blocks costly actions once a budget cannot cover them
#[derive(Debug, Clone)]
pub struct BudgetEnforcer {
    min_action_cost: Money,
}

impl BudgetEnforcer {
    pub fn new(min_action_cost: Money) -> Self {
        Self { min_action_cost }
    }

    /// Amount a costly action needs. `spawn_child` needs the budget it hands
    /// to the child; everything else needs the configured minimum.
    pub fn required_amount(
        &self,
        action: ActionKind,
        params: &Value,
    ) -> Result<Money, serde_json::Error> {
        match action {
            ActionKind::SpawnChild => Ok(budget_param(params)?
                .map(|b| b.max(self.min_action_cost))
                .unwrap_or(self.min_action_cost)),
            _ => Ok(self.min_action_cost),
        }
    }

    pub fn check_action(
        &self,
        action: ActionKind,
        params: &Value,
        budget: &BudgetData,
        spent: Money,
    ) -> ActionDecision {
        if classify_action(action, params) == ActionCost::Free {
            return ActionDecision::Allowed;
        }

        let required = match self.required_amount(action, params) {
            Ok(required) => required,
            Err(e) => {
                warn!("Blocking {}: unreadable budget parameter: {}", action, e);
                return ActionDecision::Blocked {
                    reason: BlockReason::InvalidAmount,
                    required: Money::ZERO,
                };
            }
        };

        if has_available(budget, spent, required) {
            debug!("Allowing {} (needs {})", action, required);
            ActionDecision::Allowed
        } else {
            warn!("Blocking {}: over budget (needs {})", action, required);
            ActionDecision::Blocked {
                reason: BlockReason::OverBudget,
                required,
            }
        }
    }
}

impl Default for BudgetEnforcer {
    fn default() -> Self {
        Self::new(Money::from_cents(1))
    }
}
