//! Distilled lessons and their accumulation
//!
//! Lessons are what survives of discarded history. They only ever accumulate:
//! a new lesson either joins the list or reinforces an existing duplicate
//! (hash match, or embedding similarity above a threshold).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Lesson category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonKind {
    /// Something learned about the task or the world
    Factual,
    /// Something learned about how to work
    Behavioral,
}

/// Distilled knowledge record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    #[serde(rename = "type")]
    pub kind: LessonKind,
    pub content: String,
    /// Times this lesson has been learned
    #[serde(default = "default_confidence")]
    pub confidence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub hash: String,
    pub learned_at: DateTime<Utc>,
}

fn default_confidence() -> u32 {
    1
}

impl Lesson {
    pub fn new(kind: LessonKind, content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = Self::compute_hash(kind, &content);
        Self {
            kind,
            content,
            confidence: default_confidence(),
            embedding: None,
            hash,
            learned_at: Utc::now(),
        }
    }

    pub fn factual(content: impl Into<String>) -> Self {
        Self::new(LessonKind::Factual, content)
    }

    pub fn behavioral(content: impl Into<String>) -> Self {
        Self::new(LessonKind::Behavioral, content)
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Hash of kind and whitespace/case-normalized content
    pub fn compute_hash(kind: LessonKind, content: &str) -> String {
        let normalized = content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", kind).as_bytes());
        hasher.update(b"|");
        hasher.update(normalized.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Lesson errors
#[derive(Debug, Error)]
pub enum LessonError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Accumulation failed: {0}")]
    Accumulation(String),
}

/// Produces embedding vectors for duplicate detection
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LessonError>;
}

/// Options for `LessonAccumulator::accumulate`
#[derive(Clone)]
pub struct AccumulateOptions {
    /// When set, near-duplicates are detected by cosine similarity
    pub embedder: Option<Arc<dyn Embedder>>,
    pub similarity_threshold: f32,
}

impl Default for AccumulateOptions {
    fn default() -> Self {
        Self {
            embedder: None,
            similarity_threshold: 0.9,
        }
    }
}

impl std::fmt::Debug for AccumulateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccumulateOptions")
            .field("embedder", &self.embedder.is_some())
            .field("similarity_threshold", &self.similarity_threshold)
            .finish()
    }
}

/// Merges freshly reflected lessons into an existing list
#[async_trait]
pub trait LessonAccumulator: Send + Sync {
    async fn accumulate(
        &self,
        existing: Vec<Lesson>,
        new_lessons: Vec<Lesson>,
        options: &AccumulateOptions,
    ) -> Result<Vec<Lesson>, LessonError>;
}

/// Cosine similarity; 0.0 for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Hash dedup, plus embedding dedup when an embedder is supplied
#[derive(Debug, Default, Clone)]
pub struct DedupAccumulator;

impl DedupAccumulator {
    async fn ensure_embedding(
        lesson: &mut Lesson,
        embedder: &dyn Embedder,
    ) -> Result<(), LessonError> {
        if lesson.embedding.is_none() {
            lesson.embedding = Some(embedder.embed(&lesson.content).await?);
        }
        Ok(())
    }
}

#[async_trait]
impl LessonAccumulator for DedupAccumulator {
    async fn accumulate(
        &self,
        existing: Vec<Lesson>,
        new_lessons: Vec<Lesson>,
        options: &AccumulateOptions,
    ) -> Result<Vec<Lesson>, LessonError> {
        let mut merged = existing;

        for mut lesson in new_lessons {
            if let Some(dup) = merged.iter_mut().find(|l| l.hash == lesson.hash) {
                dup.confidence += lesson.confidence;
                debug!("Reinforced lesson by hash: {}", dup.hash);
                continue;
            }

            if let Some(embedder) = options.embedder.as_deref() {
                Self::ensure_embedding(&mut lesson, embedder).await?;
                let candidate = lesson.embedding.clone().unwrap_or_default();

                let mut reinforced = false;
                for known in merged.iter_mut().filter(|l| l.kind == lesson.kind) {
                    Self::ensure_embedding(known, embedder).await?;
                    let similarity =
                        cosine_similarity(known.embedding.as_deref().unwrap_or(&[]), &candidate);
                    if similarity >= options.similarity_threshold {
                        known.confidence += lesson.confidence;
                        debug!("Reinforced lesson by similarity {:.3}", similarity);
                        reinforced = true;
                        break;
                    }
                }
                if reinforced {
                    continue;
                }
            }

            merged.push(lesson);
        }

        Ok(merged)
    }
}
