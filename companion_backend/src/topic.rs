//! Reproducible topic-injection decisions.
//!
//! The draw for a turn is seeded from `sha256(conv_key:round_id:salt)`, so the
//! same turn always replays to the same decision and seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analysis::{EmotionAnalysis, RISK_THRESHOLD};
use crate::persona::{Persona, GENERIC_TOPIC_BANK};

pub const MIN_INJECT_PROBABILITY: f64 = 0.10;
pub const MAX_INJECT_PROBABILITY: f64 = 0.88;
pub const MAX_SEED_CHARS: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TopicDecision {
    pub inject: bool,
    pub seed: String,
    /// The reproducible draw in [0, 1) the decision was made from
    pub draw: f64,
}

pub struct TopicInjectionPolicy {
    salt: String,
}

impl TopicInjectionPolicy {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Keyed pseudo-random draw for one turn.
    pub fn draw(&self, conv_key: &str, round_id: u64) -> f64 {
        let digest = Sha256::digest(format!("{}:{}:{}", conv_key, round_id, self.salt).as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        StdRng::from_seed(seed).gen::<f64>()
    }

    pub fn probability(continuation_need: f64) -> f64 {
        let need = if continuation_need.is_finite() {
            continuation_need.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (MIN_INJECT_PROBABILITY + need * 0.78).clamp(MIN_INJECT_PROBABILITY, MAX_INJECT_PROBABILITY)
    }

    pub fn should_inject(&self, conv_key: &str, round_id: u64, continuation_need: f64) -> bool {
        self.draw(conv_key, round_id) < Self::probability(continuation_need)
    }

    /// Prefer the model's suggestion, then the persona bank, then the generic bank.
    pub fn pick_seed(&self, persona: &Persona, suggested_seeds: &[String], fallback_text: &str) -> String {
        if let Some(seed) = suggested_seeds
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
        {
            return seed.chars().take(MAX_SEED_CHARS).collect();
        }

        let index = stable_index(fallback_text);
        if !persona.topic_bank.is_empty() {
            return persona.topic_bank[index % persona.topic_bank.len()].clone();
        }
        GENERIC_TOPIC_BANK[index % GENERIC_TOPIC_BANK.len()].to_string()
    }

    /// Full decision for a turn, gated off while the user is struggling.
    pub fn decide(
        &self,
        conv_key: &str,
        round_id: u64,
        analysis: &EmotionAnalysis,
        persona: &Persona,
        user_text: &str,
        user_distress: bool,
    ) -> TopicDecision {
        let draw = self.draw(conv_key, round_id);
        let seed = self.pick_seed(persona, &analysis.topic_seeds, user_text);

        if user_distress || shows_distress(analysis) {
            tracing::debug!("Topic injection gated off for {} round {}", conv_key, round_id);
            return TopicDecision {
                inject: false,
                seed,
                draw,
            };
        }

        TopicDecision {
            inject: draw < Self::probability(analysis.continuation_need),
            seed,
            draw,
        }
    }
}

/// Negative valence or distress indicators in the analysis.
pub fn shows_distress(analysis: &EmotionAnalysis) -> bool {
    analysis.valence < -0.2
        || analysis.risk.peak() >= RISK_THRESHOLD
        || analysis.sadness >= 0.6
        || analysis.anxiety >= 0.6
}

fn stable_index(text: &str) -> usize {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % (usize::MAX as u64)) as usize
}
