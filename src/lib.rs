//! Budget escrow and context condensation for trees of LLM agents
//!
//! Each agent owns a [`budget::BudgetData`] and an
//! [`condensation::AgentState`]. Parents commit part of their budget to the
//! children they spawn and get it back on dismissal; model histories are
//! condensed into lessons when a model asks for it or when they outgrow the
//! model's context window. [`agent::AgentCore`] ties both together.

pub mod agent;
pub mod budget;
pub mod condensation;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use agent::{reallocate, AgentCore, AgentDeps};
pub use budget::{BudgetData, BudgetError, BudgetMode, Money};
pub use condensation::{AgentState, CondensationEngine, CondensationOutcome, HistoryEntry};
pub use config::Config;
pub use error::{CoreError, Result};
