//! Condensation engine
//!
//! Two triggers fold the oldest part of a model's history away:
//! - a model response that explicitly asks to condense its `N` oldest messages
//! - the history's estimated token size crossing a fraction of the model's
//!   context limit, in which case more than 80% of its tokens are dropped
//!
//! Both end in the same routine: reflect on the discarded entries, merge the
//! resulting lessons, replace the model state, commit the shortened history
//! and persist. Reflection failures degrade to plain truncation.

use super::formatter::format_for_reflection;
use super::history::{AgentState, HistoryEntry, ModelId};
use super::lessons::{AccumulateOptions, DedupAccumulator, Embedder, Lesson, LessonAccumulator};
use super::persistence::StatePersistence;
use super::reflector::{Reflection, ReflectionOptions, Reflector, ReflectorError};
use super::token_estimator::{
    default_estimator, estimate_tokens, split_by_count, split_by_token_budget, TokenEstimator,
    MIN_RETAINED_ENTRIES,
};
use crate::metrics::METRICS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Condensation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondensationConfig {
    /// Share of a model's context limit at which token-overflow condensation starts
    #[serde(default = "default_trigger_fraction")]
    pub trigger_fraction: f64,

    /// Context limit for models without an explicit entry
    #[serde(default = "default_context_limit")]
    pub default_context_limit: usize,

    /// Per-model context limits
    #[serde(default)]
    pub context_limits: HashMap<String, usize>,

    /// Upper bound on a single reflection call
    #[serde(default = "default_reflection_timeout_ms")]
    pub reflection_timeout_ms: u64,

    /// Cosine similarity at which two lessons count as duplicates
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_max_lessons")]
    pub max_lessons_per_reflection: usize,
}

fn default_trigger_fraction() -> f64 {
    0.9
}

fn default_context_limit() -> usize {
    128_000
}

fn default_reflection_timeout_ms() -> u64 {
    60_000
}

fn default_similarity_threshold() -> f32 {
    0.9
}

fn default_max_lessons() -> usize {
    8
}

impl Default for CondensationConfig {
    fn default() -> Self {
        Self {
            trigger_fraction: default_trigger_fraction(),
            default_context_limit: default_context_limit(),
            context_limits: HashMap::new(),
            reflection_timeout_ms: default_reflection_timeout_ms(),
            similarity_threshold: default_similarity_threshold(),
            max_lessons_per_reflection: default_max_lessons(),
        }
    }
}

impl CondensationConfig {
    /// Context limit for `model_id`. Keys match case-insensitively since
    /// file and environment sources deliver them lowercased.
    pub fn context_limit(&self, model_id: &str) -> usize {
        self.context_limits
            .get(model_id)
            .or_else(|| {
                self.context_limits
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(model_id))
                    .map(|(_, limit)| limit)
            })
            .copied()
            .unwrap_or(self.default_context_limit)
    }

    /// Token count above which a model's history is condensed
    pub fn overflow_threshold(&self, model_id: &str) -> usize {
        (self.context_limit(model_id) as f64 * self.trigger_fraction) as usize
    }
}

/// What started a condensation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondensationTrigger {
    /// The model asked for `requested` entries; `applied` after clamping
    Requested { requested: usize, applied: usize },
    TokenOverflow { tokens: usize, threshold: usize },
}

impl CondensationTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requested { .. } => "requested",
            Self::TokenOverflow { .. } => "token_overflow",
        }
    }
}

/// Why nothing was condensed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Two entries or fewer; nothing can be discarded safely
    HistoryTooShort { len: usize },
    /// The response carried no positive condense request
    NotRequested,
    WithinLimit { tokens: usize, threshold: usize },
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HistoryTooShort { .. } => "history_too_short",
            Self::NotRequested => "not_requested",
            Self::WithinLimit { .. } => "within_limit",
        }
    }
}

/// Details of a completed condensation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondensationReport {
    pub trigger: CondensationTrigger,
    pub discarded: usize,
    pub kept: usize,
    pub lessons_added: usize,
    /// False when reflection failed and the history was only truncated
    pub reflected: bool,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondensationOutcome {
    Skipped(SkipReason),
    Condensed(CondensationReport),
}

impl CondensationOutcome {
    pub fn is_condensed(&self) -> bool {
        matches!(self, Self::Condensed(_))
    }

    pub fn report(&self) -> Option<&CondensationReport> {
        match self {
            Self::Condensed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

/// Extract a positive `condense` count from a raw model response.
///
/// Responses are JSON objects, optionally fenced or surrounded by prose.
pub fn parse_condense_request(raw: &str) -> Option<usize> {
    let trimmed = raw.trim();
    let value: Value = serde_json::from_str(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&trimmed[start..=end]).ok()
    })?;

    let n = match value.get("condense")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };

    usize::try_from(n).ok().filter(|&n| n > 0)
}

/// Clamp a requested count so the last two entries survive.
/// `None` when the history is too short to condense at all.
pub fn clamp_condense_count(history_len: usize, requested: usize) -> Option<usize> {
    if requested == 0 || history_len <= MIN_RETAINED_ENTRIES {
        return None;
    }
    let max_n = history_len - MIN_RETAINED_ENTRIES;
    Some(requested.min(max_n))
}

/// Every lesson already known must survive a merge, matched by hash
fn keeps_all(existing: &[Lesson], merged: &[Lesson]) -> bool {
    existing
        .iter()
        .all(|known| merged.iter().any(|lesson| lesson.hash == known.hash))
}

/// Condenses per-model histories of one agent's state
pub struct CondensationEngine {
    config: CondensationConfig,
    estimator: Arc<dyn TokenEstimator>,
    reflector: Arc<dyn Reflector>,
    accumulator: Arc<dyn LessonAccumulator>,
    persistence: Arc<dyn StatePersistence>,
    accumulate_options: AccumulateOptions,
}

impl CondensationEngine {
    /// Create an engine with the default estimator and dedup accumulator
    pub fn new(
        config: CondensationConfig,
        reflector: Arc<dyn Reflector>,
        persistence: Arc<dyn StatePersistence>,
    ) -> Self {
        let accumulate_options = AccumulateOptions {
            embedder: None,
            similarity_threshold: config.similarity_threshold,
        };
        Self {
            config,
            estimator: default_estimator(),
            reflector,
            accumulator: Arc::new(DedupAccumulator),
            persistence,
            accumulate_options,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_accumulator(mut self, accumulator: Arc<dyn LessonAccumulator>) -> Self {
        self.accumulator = accumulator;
        self
    }

    /// Use embeddings to detect near-duplicate lessons
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.accumulate_options.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &CondensationConfig {
        &self.config
    }

    pub fn estimate_history_tokens(&self, history: &[HistoryEntry]) -> usize {
        estimate_tokens(self.estimator.as_ref(), history)
    }

    /// Inline path: condense if the raw response asks for it
    pub async fn condense_from_response(
        &self,
        state: AgentState,
        model_id: &str,
        raw_response: &str,
    ) -> (AgentState, CondensationOutcome) {
        match parse_condense_request(raw_response) {
            Some(n) => self.condense_requested(state, model_id, n).await,
            None => (state, CondensationOutcome::Skipped(SkipReason::NotRequested)),
        }
    }

    /// Fold away the `requested` oldest entries of a model's history
    pub async fn condense_requested(
        &self,
        state: AgentState,
        model_id: &str,
        requested: usize,
    ) -> (AgentState, CondensationOutcome) {
        let len = state.history(model_id).len();

        if requested == 0 {
            return (state, CondensationOutcome::Skipped(SkipReason::NotRequested));
        }

        let applied = match clamp_condense_count(len, requested) {
            Some(n) => n,
            None => {
                info!(
                    "Skipping condense of {} for {}: history has only {} entries",
                    model_id, state.agent_id, len
                );
                return self.skip(state, SkipReason::HistoryTooShort { len });
            }
        };

        if applied < requested {
            warn!(
                "Condense request of {} for {} exceeds max {}, clamping",
                requested, model_id, applied
            );
        }

        let (to_discard, to_keep) = split_by_count(state.history(model_id), applied);
        let trigger = CondensationTrigger::Requested { requested, applied };
        self.finish(state, model_id, to_discard, to_keep, trigger)
            .await
    }

    /// True when a model's history exceeds its overflow threshold
    pub fn needs_token_condensation(&self, state: &AgentState, model_id: &str) -> bool {
        self.estimate_history_tokens(state.history(model_id))
            > self.config.overflow_threshold(model_id)
    }

    /// Token-overflow path for one model
    pub async fn condense_if_over_limit(
        &self,
        state: AgentState,
        model_id: &str,
    ) -> (AgentState, CondensationOutcome) {
        let history = state.history(model_id);
        let len = history.len();
        let tokens = self.estimate_history_tokens(history);
        let threshold = self.config.overflow_threshold(model_id);

        if tokens <= threshold {
            debug!("{} history within limit: {} <= {}", model_id, tokens, threshold);
            return (
                state,
                CondensationOutcome::Skipped(SkipReason::WithinLimit { tokens, threshold }),
            );
        }

        if len <= MIN_RETAINED_ENTRIES {
            warn!(
                "{} history over limit ({} > {}) but only {} entries, cannot condense",
                model_id, tokens, threshold, len
            );
            return self.skip(state, SkipReason::HistoryTooShort { len });
        }

        let (to_discard, to_keep) = split_by_token_budget(self.estimator.as_ref(), history, tokens);
        info!(
            "{} history over limit ({} > {}), discarding {} of {} entries",
            model_id,
            tokens,
            threshold,
            to_discard.len(),
            len
        );

        let trigger = CondensationTrigger::TokenOverflow { tokens, threshold };
        self.finish(state, model_id, to_discard, to_keep, trigger)
            .await
    }

    /// Token-overflow path for every model in the state
    pub async fn condense_all_over_limit(
        &self,
        mut state: AgentState,
    ) -> (AgentState, Vec<(ModelId, CondensationOutcome)>) {
        let mut outcomes = Vec::new();
        for model_id in state.model_ids() {
            let (next, outcome) = self.condense_if_over_limit(state, &model_id).await;
            state = next;
            outcomes.push((model_id, outcome));
        }
        (state, outcomes)
    }

    fn skip(&self, state: AgentState, reason: SkipReason) -> (AgentState, CondensationOutcome) {
        METRICS.record_skip(reason.label());
        (state, CondensationOutcome::Skipped(reason))
    }

    async fn reflect(
        &self,
        state: &AgentState,
        model_id: &str,
        to_discard: &[HistoryEntry],
    ) -> Result<Reflection, ReflectorError> {
        let messages = format_for_reflection(to_discard);
        let options = ReflectionOptions {
            max_lessons: self.config.max_lessons_per_reflection,
            known_lessons: state
                .lessons(model_id)
                .iter()
                .map(|l| l.content.clone())
                .collect(),
            current_state: state.model_state(model_id).cloned(),
        };

        let timeout = Duration::from_millis(self.config.reflection_timeout_ms);
        match tokio::time::timeout(timeout, self.reflector.reflect(&messages, model_id, &options))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ReflectorError::Timeout(timeout)),
        }
    }

    /// Merge reflected lessons and state into `state`; returns lessons added
    async fn absorb_reflection(
        &self,
        state: &mut AgentState,
        model_id: &str,
        reflection: Reflection,
    ) -> usize {
        let Reflection {
            lessons,
            state_entries,
        } = reflection;

        let mut added = 0;
        if !lessons.is_empty() {
            let existing = state.lessons(model_id).to_vec();
            let before = existing.len();

            let merged = match self
                .accumulator
                .accumulate(existing.clone(), lessons.clone(), &self.accumulate_options)
                .await
            {
                Ok(merged) if keeps_all(&existing, &merged) => merged,
                Ok(_) => {
                    warn!("Lesson accumulator dropped lessons for {}, appending instead", model_id);
                    existing.into_iter().chain(lessons).collect()
                }
                Err(e) => {
                    warn!("Lesson accumulation failed for {}: {}, appending instead", model_id, e);
                    existing.into_iter().chain(lessons).collect()
                }
            };

            added = merged.len().saturating_sub(before);
            state.context_lessons.insert(model_id.to_string(), merged);
        }

        if let Some(first) = state_entries.into_iter().next() {
            state.model_states.insert(model_id.to_string(), first);
        }

        added
    }

    async fn finish(
        &self,
        mut state: AgentState,
        model_id: &str,
        to_discard: Vec<HistoryEntry>,
        to_keep: Vec<HistoryEntry>,
        trigger: CondensationTrigger,
    ) -> (AgentState, CondensationOutcome) {
        let (lessons_added, reflected) = match self.reflect(&state, model_id, &to_discard).await {
            Ok(reflection) => (
                self.absorb_reflection(&mut state, model_id, reflection).await,
                true,
            ),
            Err(e) => {
                warn!(
                    "Reflection failed for {} on {}, condensing without lessons: {}",
                    model_id, state.agent_id, e
                );
                METRICS.reflector_failures.inc();
                (0, false)
            }
        };

        let discarded = to_discard.len();
        let kept = to_keep.len();
        state.model_histories.insert(model_id.to_string(), to_keep);

        let persisted = match self.persistence.persist(&state).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist state for {}: {}", state.agent_id, e);
                METRICS.persistence_failures.inc();
                false
            }
        };

        METRICS.record_condensation(trigger.label(), discarded, lessons_added);
        info!(
            "Condensed {} for {} ({}): discarded {}, kept {}, {} new lessons",
            model_id,
            state.agent_id,
            trigger.label(),
            discarded,
            kept,
            lessons_added
        );

        let report = CondensationReport {
            trigger,
            discarded,
            kept,
            lessons_added,
            reflected,
            persisted,
        };
        (state, CondensationOutcome::Condensed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condensation::formatter::ReflectionMessage;
    use crate::condensation::history::Role;
    use crate::condensation::lessons::LessonError;
    use crate::condensation::persistence::{NoopPersistence, PersistenceError};
    use crate::condensation::token_estimator::WordBasedEstimator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const MODEL: &str = "model-a";

    /// Returns a fixed reflection and records what it was shown
    #[derive(Default)]
    struct RecordingReflector {
        reflection: Reflection,
        seen: Mutex<Vec<Vec<ReflectionMessage>>>,
    }

    #[async_trait]
    impl Reflector for RecordingReflector {
        async fn reflect(
            &self,
            messages: &[ReflectionMessage],
            _model_id: &str,
            _options: &ReflectionOptions,
        ) -> Result<Reflection, ReflectorError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.reflection.clone())
        }
    }

    struct FailingReflector;

    #[async_trait]
    impl Reflector for FailingReflector {
        async fn reflect(
            &self,
            _messages: &[ReflectionMessage],
            _model_id: &str,
            _options: &ReflectionOptions,
        ) -> Result<Reflection, ReflectorError> {
            Err(ReflectorError::NetworkError("connection refused".to_string()))
        }
    }

    struct SlowReflector;

    #[async_trait]
    impl Reflector for SlowReflector {
        async fn reflect(
            &self,
            _messages: &[ReflectionMessage],
            _model_id: &str,
            _options: &ReflectionOptions,
        ) -> Result<Reflection, ReflectorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Reflection::default())
        }
    }

    struct FailingPersistence;

    #[async_trait]
    impl StatePersistence for FailingPersistence {
        async fn persist(&self, _state: &AgentState) -> Result<(), PersistenceError> {
            Err(PersistenceError::Backend("disk full".to_string()))
        }
    }

    /// Returns only the incoming lessons
    struct ReplacingAccumulator;

    #[async_trait]
    impl LessonAccumulator for ReplacingAccumulator {
        async fn accumulate(
            &self,
            _existing: Vec<Lesson>,
            new_lessons: Vec<Lesson>,
            _options: &AccumulateOptions,
        ) -> Result<Vec<Lesson>, LessonError> {
            Ok(new_lessons)
        }
    }

    struct BrokenAccumulator;

    #[async_trait]
    impl LessonAccumulator for BrokenAccumulator {
        async fn accumulate(
            &self,
            _existing: Vec<Lesson>,
            _new_lessons: Vec<Lesson>,
            _options: &AccumulateOptions,
        ) -> Result<Vec<Lesson>, LessonError> {
            Err(LessonError::Accumulation("store offline".to_string()))
        }
    }

    /// Embeds by the presence of a few keywords
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, LessonError> {
            let text = text.to_lowercase();
            Ok(["cache", "retry", "budget"]
                .iter()
                .map(|k| if text.contains(k) { 1.0 } else { 0.0 })
                .collect())
        }
    }

    fn engine_with(reflector: Arc<dyn Reflector>) -> CondensationEngine {
        CondensationEngine::new(
            CondensationConfig::default(),
            reflector,
            Arc::new(NoopPersistence),
        )
        .with_estimator(Arc::new(WordBasedEstimator::new(1.0)))
    }

    fn state_with(word_counts: &[usize]) -> AgentState {
        let mut state = AgentState::new("agent-1");
        for (i, &n) in word_counts.iter().enumerate() {
            let text = vec![format!("m{}", i); n].join(" ");
            let entry = if i % 2 == 0 {
                HistoryEntry::user(text)
            } else {
                HistoryEntry::assistant(text)
            };
            state.push_entry(MODEL, entry);
        }
        state
    }

    fn lessons_reflection() -> Reflection {
        Reflection {
            lessons: vec![
                Lesson::factual("The build needs nightly"),
                Lesson::behavioral("Check the budget before spawning"),
            ],
            state_entries: vec![json!({"summary": "first"}), json!({"summary": "second"})],
        }
    }

    #[test]
    fn test_parse_condense_request() {
        assert_eq!(parse_condense_request(r#"{"action": "wait", "condense": 3}"#), Some(3));
        assert_eq!(
            parse_condense_request("Here you go:\n```json\n{\"condense\": \"4\"}\n```"),
            Some(4)
        );
        assert_eq!(parse_condense_request(r#"{"condense": 0}"#), None);
        assert_eq!(parse_condense_request(r#"{"condense": -2}"#), None);
        assert_eq!(parse_condense_request(r#"{"action": "wait"}"#), None);
        assert_eq!(parse_condense_request("not json"), None);
    }

    #[test]
    fn test_clamp_condense_count() {
        assert_eq!(clamp_condense_count(5, 10), Some(3));
        assert_eq!(clamp_condense_count(5, 2), Some(2));
        assert_eq!(clamp_condense_count(3, 1), Some(1));
        assert_eq!(clamp_condense_count(2, 1), None);
        assert_eq!(clamp_condense_count(0, 4), None);
        assert_eq!(clamp_condense_count(9, 0), None);
    }

    #[test]
    fn test_overflow_threshold() {
        let mut config = CondensationConfig::default();
        config.context_limits.insert("small".to_string(), 1_000);
        assert_eq!(config.overflow_threshold("small"), 900);
        assert_eq!(config.overflow_threshold("other"), 115_200);
    }

    #[test]
    fn test_context_limit_ignores_case() {
        let mut config = CondensationConfig::default();
        config.context_limits.insert("small-model".to_string(), 8_000);
        assert_eq!(config.context_limit("Small-Model"), 8_000);
        assert_eq!(config.context_limit("small-model"), 8_000);
        assert_eq!(config.context_limit("large-model"), 128_000);
    }

    #[tokio::test]
    async fn test_two_entry_history_is_never_condensed() {
        let engine = engine_with(Arc::new(RecordingReflector::default()));
        for n in [1, 2, 10, usize::MAX] {
            let state = state_with(&[3, 3]);
            let original = state.clone();
            let (state, outcome) = engine.condense_requested(state, MODEL, n).await;
            assert_eq!(state, original);
            assert_eq!(
                outcome,
                CondensationOutcome::Skipped(SkipReason::HistoryTooShort { len: 2 })
            );
        }
    }

    #[tokio::test]
    async fn test_request_is_clamped_to_keep_last_two() {
        let reflector = Arc::new(RecordingReflector::default());
        let engine = engine_with(reflector.clone());
        let state = state_with(&[1, 1, 1, 1, 1]);
        let expected_kept = state.history(MODEL)[3..].to_vec();

        let (state, outcome) = engine.condense_requested(state, MODEL, 10).await;

        let report = outcome.report().unwrap();
        assert_eq!(
            report.trigger,
            CondensationTrigger::Requested {
                requested: 10,
                applied: 3
            }
        );
        assert_eq!(report.discarded, 3);
        assert_eq!(state.history(MODEL), expected_kept.as_slice());

        let seen = reflector.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 3);
        assert_eq!(seen[0][0].role, Role::User);
        assert_eq!(seen[0][1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_reflection_merges_lessons_and_replaces_state() {
        let reflector = Arc::new(RecordingReflector {
            reflection: lessons_reflection(),
            ..Default::default()
        });
        let engine = engine_with(reflector);
        let mut state = state_with(&[1, 1, 1, 1]);
        state
            .context_lessons
            .insert(MODEL.to_string(), vec![Lesson::factual("the build needs nightly")]);
        state.model_states.insert(MODEL.to_string(), json!({"summary": "old"}));

        let (state, outcome) = engine.condense_requested(state, MODEL, 2).await;

        let report = outcome.report().unwrap();
        assert!(report.reflected);
        assert_eq!(report.lessons_added, 1);
        assert_eq!(state.lessons(MODEL).len(), 2);
        assert_eq!(state.lessons(MODEL)[0].confidence, 2);
        assert_eq!(state.model_state(MODEL), Some(&json!({"summary": "first"})));
        assert_eq!(state.history(MODEL).len(), 2);
    }

    #[tokio::test]
    async fn test_accumulator_that_drops_known_lessons_is_ignored() {
        let reflector = Arc::new(RecordingReflector {
            reflection: Reflection {
                lessons: vec![Lesson::factual("Deploys freeze on Fridays")],
                state_entries: vec![],
            },
            ..Default::default()
        });
        let engine = engine_with(reflector).with_accumulator(Arc::new(ReplacingAccumulator));
        let mut state = state_with(&[1, 1, 1, 1]);
        state
            .context_lessons
            .insert(MODEL.to_string(), vec![Lesson::factual("Staging is read-only")]);

        let (state, outcome) = engine.condense_requested(state, MODEL, 2).await;

        assert_eq!(outcome.report().unwrap().lessons_added, 1);
        let contents: Vec<&str> = state
            .lessons(MODEL)
            .iter()
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(contents, ["Staging is read-only", "Deploys freeze on Fridays"]);
    }

    #[tokio::test]
    async fn test_accumulator_error_appends_lessons() {
        let reflector = Arc::new(RecordingReflector {
            reflection: lessons_reflection(),
            ..Default::default()
        });
        let engine = engine_with(reflector).with_accumulator(Arc::new(BrokenAccumulator));
        let mut state = state_with(&[1, 1, 1, 1]);
        state
            .context_lessons
            .insert(MODEL.to_string(), vec![Lesson::factual("the build needs nightly")]);

        let (state, outcome) = engine.condense_requested(state, MODEL, 2).await;

        let report = outcome.report().unwrap();
        assert!(report.reflected);
        assert_eq!(report.lessons_added, 2);
        assert_eq!(state.lessons(MODEL).len(), 3);
        assert!(state.lessons(MODEL).iter().all(|l| l.confidence == 1));
    }

    #[tokio::test]
    async fn test_embedder_merges_similar_lessons() {
        let reflector = Arc::new(RecordingReflector {
            reflection: Reflection {
                lessons: vec![
                    Lesson::factual("A cache holds previous results"),
                    Lesson::behavioral("Always retry failed calls"),
                ],
                state_entries: vec![],
            },
            ..Default::default()
        });
        let engine = engine_with(reflector).with_embedder(Arc::new(KeywordEmbedder));
        let mut state = state_with(&[1, 1, 1, 1]);
        state.context_lessons.insert(
            MODEL.to_string(),
            vec![Lesson::factual("Results are stored in a cache")],
        );

        let (state, outcome) = engine.condense_requested(state, MODEL, 2).await;

        assert_eq!(outcome.report().unwrap().lessons_added, 1);
        let lessons = state.lessons(MODEL);
        assert_eq!(lessons.len(), 2);
        assert_eq!(lessons[0].content, "Results are stored in a cache");
        assert_eq!(lessons[0].confidence, 2);
        assert!(lessons.iter().all(|l| l.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_empty_state_entries_leave_model_state() {
        let reflector = Arc::new(RecordingReflector::default());
        let engine = engine_with(reflector);
        let mut state = state_with(&[1, 1, 1]);
        state.model_states.insert(MODEL.to_string(), json!({"summary": "keep"}));

        let (state, _) = engine.condense_requested(state, MODEL, 1).await;
        assert_eq!(state.model_state(MODEL), Some(&json!({"summary": "keep"})));
    }

    #[tokio::test]
    async fn test_reflector_failure_still_truncates() {
        let engine = engine_with(Arc::new(FailingReflector));
        let mut state = state_with(&[1, 1, 1, 1]);
        state
            .context_lessons
            .insert(MODEL.to_string(), vec![Lesson::factual("kept")]);

        let (state, outcome) = engine.condense_requested(state, MODEL, 2).await;

        let report = outcome.report().unwrap();
        assert!(!report.reflected);
        assert_eq!(report.lessons_added, 0);
        assert_eq!(state.history(MODEL).len(), 2);
        assert_eq!(state.lessons(MODEL).len(), 1);
    }

    #[tokio::test]
    async fn test_reflector_timeout_still_truncates() {
        let config = CondensationConfig {
            reflection_timeout_ms: 50,
            ..Default::default()
        };
        let engine =
            CondensationEngine::new(config, Arc::new(SlowReflector), Arc::new(NoopPersistence))
                .with_estimator(Arc::new(WordBasedEstimator::new(1.0)));

        let (state, outcome) = engine
            .condense_requested(state_with(&[1, 1, 1]), MODEL, 1)
            .await;

        assert!(!outcome.report().unwrap().reflected);
        assert_eq!(state.history(MODEL).len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_truncation() {
        let engine = CondensationEngine::new(
            CondensationConfig::default(),
            Arc::new(RecordingReflector::default()),
            Arc::new(FailingPersistence),
        )
        .with_estimator(Arc::new(WordBasedEstimator::new(1.0)));

        let (state, outcome) = engine
            .condense_requested(state_with(&[1, 1, 1, 1]), MODEL, 2)
            .await;

        assert!(!outcome.report().unwrap().persisted);
        assert_eq!(state.history(MODEL).len(), 2);
    }

    #[tokio::test]
    async fn test_condense_from_response() {
        let engine = engine_with(Arc::new(RecordingReflector::default()));

        let (state, outcome) = engine
            .condense_from_response(state_with(&[1, 1, 1, 1]), MODEL, r#"{"action":"orient"}"#)
            .await;
        assert_eq!(outcome, CondensationOutcome::Skipped(SkipReason::NotRequested));
        assert_eq!(state.history(MODEL).len(), 4);

        let (state, outcome) = engine
            .condense_from_response(state, MODEL, r#"{"action":"orient","condense":1}"#)
            .await;
        assert!(outcome.is_condensed());
        assert_eq!(state.history(MODEL).len(), 3);
    }

    #[tokio::test]
    async fn test_token_overflow_six_entries() {
        let mut config = CondensationConfig::default();
        config.context_limits.insert(MODEL.to_string(), 100);
        let engine = CondensationEngine::new(
            config,
            Arc::new(RecordingReflector::default()),
            Arc::new(NoopPersistence),
        )
        .with_estimator(Arc::new(WordBasedEstimator::new(1.0)));

        // 120 tokens > 90; the last two entries hold most of them
        let state = state_with(&[10, 10, 10, 10, 40, 40]);
        assert!(engine.needs_token_condensation(&state, MODEL));
        let expected_kept = state.history(MODEL)[4..].to_vec();

        let (state, outcome) = engine.condense_if_over_limit(state, MODEL).await;

        let report = outcome.report().unwrap();
        assert_eq!(report.discarded, 4);
        assert_eq!(state.history(MODEL), expected_kept.as_slice());
        assert_eq!(
            report.trigger,
            CondensationTrigger::TokenOverflow {
                tokens: 120,
                threshold: 90
            }
        );
    }

    #[tokio::test]
    async fn test_token_overflow_stops_past_eighty_percent() {
        let mut config = CondensationConfig::default();
        config.context_limits.insert(MODEL.to_string(), 100);
        let engine = CondensationEngine::new(
            config,
            Arc::new(RecordingReflector::default()),
            Arc::new(NoopPersistence),
        )
        .with_estimator(Arc::new(WordBasedEstimator::new(1.0)));

        // 200 tokens; 170 > 160 after two entries
        let state = state_with(&[100, 70, 10, 10, 5, 5]);
        let (state, outcome) = engine.condense_if_over_limit(state, MODEL).await;

        assert_eq!(outcome.report().unwrap().discarded, 2);
        assert_eq!(state.history(MODEL).len(), 4);
    }

    #[tokio::test]
    async fn test_within_limit_is_skipped() {
        let engine = engine_with(Arc::new(RecordingReflector::default()));
        let state = state_with(&[10, 10, 10]);
        let (state, outcome) = engine.condense_if_over_limit(state, MODEL).await;
        assert!(matches!(
            outcome,
            CondensationOutcome::Skipped(SkipReason::WithinLimit { tokens: 30, .. })
        ));
        assert_eq!(state.history(MODEL).len(), 3);
    }

    #[tokio::test]
    async fn test_condense_all_over_limit() {
        let mut config = CondensationConfig::default();
        config.context_limits.insert(MODEL.to_string(), 10);
        let engine = CondensationEngine::new(
            config,
            Arc::new(RecordingReflector::default()),
            Arc::new(NoopPersistence),
        )
        .with_estimator(Arc::new(WordBasedEstimator::new(1.0)));

        let mut state = state_with(&[5, 5, 5, 5]);
        state.push_entry("model-b", HistoryEntry::user("short"));

        let (state, outcomes) = engine.condense_all_over_limit(state).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_condensed());
        assert!(!outcomes[1].1.is_condensed());
        assert_eq!(state.history(MODEL).len(), 2);
        assert_eq!(state.history("model-b").len(), 1);
    }
}
