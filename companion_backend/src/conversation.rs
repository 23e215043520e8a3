//! Per-conversation state: turn history, rolling summary and the last plan.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::EmotionAnalysis;
use crate::persona::DEFAULT_PERSONA_ID;
use crate::planner::ReplyPlan;
use crate::store::DocumentStore;

pub const CONVERSATION_KEY_PREFIX: &str = "conversation:";

/// Turns rendered into the analyzer's history text
const ANALYSIS_HISTORY_TURNS: usize = 4;
const SUMMARY_SNIPPET_CHARS: usize = 80;

pub fn make_conv_key(user_id: &str, device_id: &str, persona_id: Option<&str>) -> String {
    let persona = persona_id
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PERSONA_ID);
    format!("{}:{}:{}", user_id, device_id, persona)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub round_id: u64,
    pub user_text: String,
    /// Filled after the reply has been delivered
    #[serde(default)]
    pub assistant_text: Option<String>,
    pub analysis: EmotionAnalysis,
    pub plan: ReplyPlan,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TurnRecord {
    pub fn pending(round_id: u64, user_text: &str, analysis: EmotionAnalysis, plan: ReplyPlan) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            round_id,
            user_text: user_text.to_string(),
            assistant_text: None,
            analysis,
            plan,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.assistant_text.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationState {
    pub conv_key: String,
    #[serde(default)]
    pub round_seq: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    #[serde(default)]
    pub last_plan: Option<ReplyPlan>,
}

impl ConversationState {
    pub fn new(conv_key: &str) -> Self {
        Self {
            conv_key: conv_key.to_string(),
            ..Self::default()
        }
    }

    pub fn next_round_id(&mut self) -> u64 {
        self.round_seq += 1;
        self.round_seq
    }

    pub fn turn_mut(&mut self, round_id: u64) -> Option<&mut TurnRecord> {
        self.turns.iter_mut().find(|t| t.round_id == round_id)
    }

    /// Write the delivered text into the turn identified by `round_id`.
    /// Returns false when that turn is no longer in the history.
    pub fn complete_turn(
        &mut self,
        round_id: u64,
        assistant_text: &str,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.turn_mut(round_id) {
            Some(turn) => {
                turn.assistant_text = Some(assistant_text.to_string());
                if error.is_some() {
                    turn.error = error;
                }
                turn.completed_at = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn completed_turns(&self) -> impl Iterator<Item = &TurnRecord> {
        self.turns.iter().filter(|t| t.is_complete())
    }

    /// Keep the newest `max_turns` turns and fold older completed ones into
    /// the summary. Folding stops at the first pending turn, so a reply still
    /// in flight can always be written back by round id.
    pub fn fold_history(&mut self, max_turns: usize, summary_max_chars: usize) {
        let overflow = self.turns.len().saturating_sub(max_turns);
        let foldable = self
            .turns
            .iter()
            .take(overflow)
            .take_while(|t| t.is_complete())
            .count();
        if foldable == 0 {
            return;
        }
        for turn in self.turns.drain(..foldable) {
            let line = format!(
                "user: {} / reply: {}",
                snippet(&turn.user_text),
                snippet(turn.assistant_text.as_deref().unwrap_or_default())
            );
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(&line);
        }
        self.summary = keep_tail(&self.summary, summary_max_chars);
    }

    /// Summary plus the most recent completed exchanges, for the analyzer.
    pub fn history_text(&self) -> String {
        let completed: Vec<&TurnRecord> = self.completed_turns().collect();
        let start = completed.len().saturating_sub(ANALYSIS_HISTORY_TURNS);

        let mut lines = Vec::new();
        if !self.summary.is_empty() {
            lines.push(format!("summary: {}", self.summary));
        }
        for turn in &completed[start..] {
            lines.push(format!("user: {}", turn.user_text));
            lines.push(format!("assistant: {}", turn.assistant_text.as_deref().unwrap_or_default()));
        }
        lines.join("\n")
    }
}

fn snippet(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= SUMMARY_SNIPPET_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SUMMARY_SNIPPET_CHARS).collect();
    format!("{}...", cut)
}

/// Newest `max_chars` characters, starting at a line boundary when one exists.
fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => tail[pos + 1..].to_string(),
        _ => tail,
    }
}

pub struct ConversationStateStore {
    store: Arc<dyn DocumentStore>,
}

impl ConversationStateStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn document_key(conv_key: &str) -> String {
        format!("{}{}", CONVERSATION_KEY_PREFIX, conv_key)
    }

    /// Load the state for `conv_key`. Missing, unreadable and corrupt
    /// documents all yield a fresh state.
    pub fn load(&self, conv_key: &str) -> ConversationState {
        let key = Self::document_key(conv_key);
        let body = match self.store.get(&key) {
            Ok(Some(body)) => body,
            Ok(None) => return ConversationState::new(conv_key),
            Err(e) => {
                tracing::warn!("Failed to read {}: {:#}; starting fresh", key, e);
                return ConversationState::new(conv_key);
            }
        };

        match serde_json::from_str::<ConversationState>(&body) {
            Ok(mut state) => {
                state.conv_key = conv_key.to_string();
                state
            }
            Err(e) => {
                tracing::warn!("Corrupt conversation document {}: {}; starting fresh", key, e);
                ConversationState::new(conv_key)
            }
        }
    }

    pub fn save(&self, state: &ConversationState) -> Result<()> {
        let key = Self::document_key(&state.conv_key);
        let body = serde_json::to_string(state).context("Failed to serialize conversation state")?;
        self.store
            .put(&key, &body)
            .with_context(|| format!("Failed to persist {}", key))
    }
}
