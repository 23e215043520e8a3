use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Confidence, Signal};
use crate::llm_client::{extract_json_block, CompletionService, Message};

const CLASSIFIER_INSTRUCTION: &str = "You label relationship signals in a multi-turn conversation \
between a user and a companion persona. Output only JSON, no explanation, no comfort.\n\
Allowed signals: boundary_pressure, dependency_attempt, emotional_support, conflict_pattern, \
stable_interaction, neutral_interaction.\n\
confidence must be one of low, medium, high.\n\
Example: {\"signals\": [\"stable_interaction\"], \"confidence\": \"medium\"}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub signals: Vec<Signal>,
    pub confidence: Confidence,
}

impl Classification {
    pub fn neutral() -> Self {
        Self {
            signals: vec![Signal::NeutralInteraction],
            confidence: Confidence::Low,
        }
    }

    /// Strict validation: any unknown label, empty list or bad confidence
    /// rejects the whole reply.
    pub fn from_model_reply(raw: &str) -> Option<Self> {
        let json = extract_json_block(raw)?;
        let value: Value = serde_json::from_str(json).ok()?;

        let signals = value.get("signals")?.as_array()?;
        if signals.is_empty() {
            return None;
        }
        let signals = signals
            .iter()
            .map(|s| s.as_str().and_then(Signal::parse))
            .collect::<Option<Vec<_>>>()?;
        let confidence = value.get("confidence")?.as_str().and_then(Confidence::parse)?;

        Some(Self { signals, confidence })
    }
}

/// Labels the recent window of a conversation. Never fails: every error
/// becomes `Classification::neutral()`.
#[async_trait]
pub trait SignalClassifier: Send + Sync {
    async fn classify(&self, persona_id: &str, persona_name: &str, recent: &[Message]) -> Classification;
}

pub struct LlmSignalClassifier {
    completion: Arc<dyn CompletionService>,
}

impl LlmSignalClassifier {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    async fn attempt(&self, persona_id: &str, persona_name: &str, recent: &[Message]) -> Result<String> {
        let payload = serde_json::json!({
            "character_id": persona_id,
            "character_name": persona_name,
            "messages": recent,
        });
        self.completion
            .complete(
                vec![
                    Message::system(CLASSIFIER_INSTRUCTION),
                    Message::user(payload.to_string()),
                ],
                0.0,
            )
            .await
            .context("Signal classification request failed")
    }
}

#[async_trait]
impl SignalClassifier for LlmSignalClassifier {
    async fn classify(&self, persona_id: &str, persona_name: &str, recent: &[Message]) -> Classification {
        match self.attempt(persona_id, persona_name, recent).await {
            Ok(raw) => Classification::from_model_reply(&raw).unwrap_or_else(|| {
                tracing::warn!("Signal classifier reply rejected, using neutral fallback");
                Classification::neutral()
            }),
            Err(e) => {
                tracing::warn!("{:#}; using neutral fallback", e);
                Classification::neutral()
            }
        }
    }
}
