//! Conversation context condensation
//!
//! Keeps per-model histories within their context windows by folding the
//! oldest entries into lessons and a running model state.

pub mod engine;
pub mod formatter;
pub mod history;
pub mod lessons;
pub mod persistence;
pub mod reflector;
pub mod token_estimator;

pub use engine::{
    clamp_condense_count, parse_condense_request, CondensationConfig, CondensationEngine,
    CondensationOutcome, CondensationReport, CondensationTrigger, SkipReason,
};
pub use formatter::{format_for_reflection, ReflectionMessage};
pub use history::{AgentState, ContentPart, EntryContent, EntryKind, HistoryEntry, ModelId, Role};
pub use lessons::{
    AccumulateOptions, DedupAccumulator, Embedder, Lesson, LessonAccumulator, LessonError,
    LessonKind,
};
pub use persistence::{JsonFilePersistence, NoopPersistence, PersistenceError, StatePersistence};
pub use reflector::{
    LlmReflector, NullReflector, Reflection, ReflectionOptions, Reflector, ReflectorConfig,
    ReflectorError,
};
pub use token_estimator::{
    TiktokenEstimator, TokenEstimator, WordBasedEstimator, MIN_RETAINED_ENTRIES,
    TOKEN_DISCARD_RATIO,
};
