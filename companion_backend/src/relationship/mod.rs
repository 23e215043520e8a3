//! Per user×persona relationship tracking.
//!
//! The affinity score moves only through the judge, and only by deltas the
//! judge has already bounded; `RelationshipState::apply` clamps again on
//! persist so the score can never leave [0, 100].

pub mod classifier;
pub mod judge;
pub mod report;
pub mod trigger;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::DocumentStore;

pub use classifier::{Classification, LlmSignalClassifier, SignalClassifier};
pub use judge::{AffinityJudge, JudgeOutcome};
pub use report::{build_report, RelationshipReport};
pub use trigger::{check_trigger, EvalTrigger};

pub const RELATIONSHIP_KEY_PREFIX: &str = "relationship:";
pub const DEFAULT_AFFINITY: f64 = 50.0;
pub const MIN_AFFINITY: f64 = 0.0;
pub const MAX_AFFINITY: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    BoundaryPressure,
    DependencyAttempt,
    ConflictPattern,
    StableInteraction,
    EmotionalSupport,
    NeutralInteraction,
}

impl Signal {
    pub const ALL: [Signal; 6] = [
        Signal::BoundaryPressure,
        Signal::DependencyAttempt,
        Signal::ConflictPattern,
        Signal::StableInteraction,
        Signal::EmotionalSupport,
        Signal::NeutralInteraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::BoundaryPressure => "boundary_pressure",
            Signal::DependencyAttempt => "dependency_attempt",
            Signal::ConflictPattern => "conflict_pattern",
            Signal::StableInteraction => "stable_interaction",
            Signal::EmotionalSupport => "emotional_support",
            Signal::NeutralInteraction => "neutral_interaction",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

/// Debounce counters for lower-confidence negative signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskBuffer {
    #[serde(default)]
    pub boundary_pressure: u32,
    #[serde(default)]
    pub dependency_attempt: u32,
    #[serde(default)]
    pub conflict_pattern: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RiskBuffer {
    pub fn counter_mut(&mut self, signal: Signal) -> Option<&mut u32> {
        match signal {
            Signal::BoundaryPressure => Some(&mut self.boundary_pressure),
            Signal::DependencyAttempt => Some(&mut self.dependency_attempt),
            Signal::ConflictPattern => Some(&mut self.conflict_pattern),
            _ => None,
        }
    }

    pub fn clear_counters(&mut self) {
        self.boundary_pressure = 0;
        self.dependency_attempt = 0;
        self.conflict_pattern = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalLogEntry {
    pub at: DateTime<Utc>,
    pub signals: Vec<Signal>,
    pub confidence: Confidence,
    pub delta: f64,
    pub score_after: f64,
    pub note: String,
    pub trigger: EvalTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipState {
    pub user_id: String,
    pub persona_id: String,
    #[serde(default = "default_affinity")]
    pub affinity_score: f64,
    #[serde(default)]
    pub stable_streak: u32,
    #[serde(default)]
    pub last_streak_reward_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_eval_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages_since_eval: u32,
    #[serde(default)]
    pub risk_buffer: RiskBuffer,
    #[serde(default)]
    pub eval_log: Vec<EvalLogEntry>,
}

fn default_affinity() -> f64 {
    DEFAULT_AFFINITY
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(MIN_AFFINITY, MAX_AFFINITY)
    } else {
        DEFAULT_AFFINITY
    }
}

impl RelationshipState {
    pub fn new(user_id: &str, persona_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            affinity_score: DEFAULT_AFFINITY,
            stable_streak: 0,
            last_streak_reward_at: None,
            last_eval_at: None,
            messages_since_eval: 0,
            risk_buffer: RiskBuffer::default(),
            eval_log: Vec::new(),
        }
    }

    /// Add `delta` and clamp. Returns the new score.
    pub fn apply(&mut self, delta: f64) -> f64 {
        self.affinity_score = clamp_score(self.affinity_score + delta);
        self.affinity_score
    }

    /// Append to the evaluation log, dropping the oldest entries past `limit`.
    pub fn record_evaluation(&mut self, entry: EvalLogEntry, limit: usize) {
        self.last_eval_at = Some(entry.at);
        self.messages_since_eval = 0;
        self.eval_log.push(entry);
        if self.eval_log.len() > limit {
            let excess = self.eval_log.len() - limit;
            self.eval_log.drain(..excess);
        }
    }
}

pub fn relationship_key(user_id: &str, persona_id: &str) -> String {
    format!("{}{}:{}", RELATIONSHIP_KEY_PREFIX, user_id, persona_id)
}

pub struct RelationshipStateStore {
    store: Arc<dyn DocumentStore>,
}

impl RelationshipStateStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Load the state for a pair. Missing, unreadable and corrupt documents
    /// all yield the default state.
    pub fn load(&self, user_id: &str, persona_id: &str) -> RelationshipState {
        let key = relationship_key(user_id, persona_id);
        let body = match self.store.get(&key) {
            Ok(Some(body)) => body,
            Ok(None) => return RelationshipState::new(user_id, persona_id),
            Err(e) => {
                tracing::warn!("Failed to read {}: {:#}; using default state", key, e);
                return RelationshipState::new(user_id, persona_id);
            }
        };

        match serde_json::from_str::<RelationshipState>(&body) {
            Ok(mut state) => {
                state.user_id = user_id.to_string();
                state.persona_id = persona_id.to_string();
                state.affinity_score = clamp_score(state.affinity_score);
                state
            }
            Err(e) => {
                tracing::warn!("Corrupt relationship document {}: {}; using default state", key, e);
                RelationshipState::new(user_id, persona_id)
            }
        }
    }

    pub fn save(&self, state: &RelationshipState) -> Result<()> {
        let key = relationship_key(&state.user_id, &state.persona_id);
        let body = serde_json::to_string(state).context("Failed to serialize relationship state")?;
        self.store
            .put(&key, &body)
            .with_context(|| format!("Failed to persist {}", key))
    }

    /// Every stored (user_id, persona_id) pair.
    ///
    /// Ids are read from the documents, since either id may contain ':'.
    /// Unreadable documents fall back to splitting the key at its last ':'.
    pub fn list_pairs(&self) -> Result<Vec<(String, String)>> {
        let keys = self.store.keys_with_prefix(RELATIONSHIP_KEY_PREFIX)?;
        let mut pairs = Vec::with_capacity(keys.len());
        for key in &keys {
            let stored = self
                .store
                .get(key)?
                .and_then(|body| serde_json::from_str::<RelationshipState>(&body).ok())
                .filter(|state| relationship_key(&state.user_id, &state.persona_id) == *key);
            match stored {
                Some(state) => pairs.push((state.user_id, state.persona_id)),
                None => {
                    if let Some((user, persona)) = key
                        .strip_prefix(RELATIONSHIP_KEY_PREFIX)
                        .and_then(|rest| rest.rsplit_once(':'))
                    {
                        pairs.push((user.to_string(), persona.to_string()));
                    }
                }
            }
        }
        Ok(pairs)
    }
}
