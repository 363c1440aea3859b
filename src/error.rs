//! Crate-level error type

use crate::budget::{BudgetError, LedgerError, SchemaError, UnknownAction};
use crate::condensation::{LessonError, PersistenceError, ReflectorError};
use crate::config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),

    #[error(transparent)]
    Reflector(#[from] ReflectorError),

    #[error(transparent)]
    Lesson(#[from] LessonError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}
