use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::RelationshipState;
use crate::config::RelationshipConfig;
use crate::safety::contains_risk_keyword;

/// Why an evaluation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTrigger {
    MessageCount,
    RiskKeyword,
}

/// Decide whether this turn evaluates the relationship. Expects
/// `messages_since_eval` to already include the current turn.
pub fn check_trigger(
    state: &RelationshipState,
    user_text: &str,
    config: &RelationshipConfig,
    now: DateTime<Utc>,
) -> Option<EvalTrigger> {
    if contains_risk_keyword(user_text, &config.risk_keywords) {
        return Some(EvalTrigger::RiskKeyword);
    }

    if state.messages_since_eval < config.eval_message_threshold {
        return None;
    }

    let cooldown = Duration::seconds(config.eval_cooldown_secs as i64);
    match state.last_eval_at {
        Some(last) if now - last < cooldown => None,
        _ => Some(EvalTrigger::MessageCount),
    }
}
