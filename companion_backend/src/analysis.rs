//! Emotion analysis of the incoming user message.
//!
//! The analyzer has a single contract: it always returns an analysis. A reply
//! that cannot be parsed gets one corrective retry; after that the neutral
//! analysis is returned with `degraded` set.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisMode;
use crate::llm_client::{extract_json_block, CompletionService, Message};

/// Risk subscores threshold at which a turn is treated as high risk.
pub const RISK_THRESHOLD: f64 = 0.35;

const ANALYSIS_INSTRUCTION: &str = "You are a conversation analyzer. Output exactly one strict JSON object, \
no markdown, no explanation. Fields: intent (one of venting, support, question, chat), \
summary (short label), valence (-1..1), arousal, anxiety, anger, sadness (0..1), \
risk_self_harm, risk_violence, risk_abuse (0..1), continuation_need (0..1), \
topic_seeds (2-4 short phrases tied to the recent conversation), \
avoid (phrases the reply should not use).";

const CORRECTIVE_INSTRUCTION: &str = "Your previous reply was not valid JSON. \
Reply again with only the JSON object and nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentCategory {
    Venting,
    Support,
    Question,
    Chat,
}

impl IntentCategory {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        if label.contains("vent") {
            IntentCategory::Venting
        } else if label.contains("support") || label.contains("comfort") {
            IntentCategory::Support
        } else if label.contains("question") || label.contains("advice") {
            IntentCategory::Question
        } else {
            IntentCategory::Chat
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskScores {
    pub self_harm: f64,
    pub violence: f64,
    pub abuse: f64,
}

impl RiskScores {
    pub fn peak(&self) -> f64 {
        self.self_harm.max(self.violence).max(self.abuse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionAnalysis {
    pub intent: String,
    pub summary: String,
    pub valence: f64,
    pub arousal: f64,
    pub anxiety: f64,
    pub anger: f64,
    pub sadness: f64,
    pub risk: RiskScores,
    pub continuation_need: f64,
    #[serde(default)]
    pub topic_seeds: Vec<String>,
    #[serde(default)]
    pub avoid: Vec<String>,
    /// Set when this is the neutral fallback rather than a real analysis
    #[serde(default)]
    pub degraded: bool,
}

impl EmotionAnalysis {
    pub fn neutral() -> Self {
        Self {
            intent: "chat".to_string(),
            summary: "neutral".to_string(),
            valence: 0.0,
            arousal: 0.35,
            anxiety: 0.2,
            anger: 0.1,
            sadness: 0.2,
            risk: RiskScores::default(),
            continuation_need: 0.3,
            topic_seeds: Vec::new(),
            avoid: Vec::new(),
            degraded: false,
        }
    }

    pub fn intent_category(&self) -> IntentCategory {
        IntentCategory::from_label(&self.intent)
    }

    pub fn high_risk(&self) -> bool {
        self.risk.peak() >= RISK_THRESHOLD
    }

    /// Parse a model reply, clamping numbers into their domains.
    pub fn from_model_reply(raw: &str) -> Result<Self> {
        let json = extract_json_block(raw).context("No JSON object in analysis reply")?;
        let parsed: RawAnalysis =
            serde_json::from_str(json).context("Analysis reply is not a valid analysis object")?;
        Ok(parsed.into_analysis())
    }
}

/// Wire shape of the analyzer reply; every field optional so a partial reply
/// still yields a usable analysis.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    intent: Option<String>,
    #[serde(alias = "notes")]
    summary: Option<String>,
    valence: Option<f64>,
    arousal: Option<f64>,
    anxiety: Option<f64>,
    anger: Option<f64>,
    sadness: Option<f64>,
    risk_self_harm: Option<f64>,
    risk_violence: Option<f64>,
    risk_abuse: Option<f64>,
    continuation_need: Option<f64>,
    #[serde(default)]
    topic_seeds: Vec<String>,
    #[serde(default, alias = "do_not")]
    avoid: Vec<String>,
}

fn unit(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => default,
    }
}

impl RawAnalysis {
    fn into_analysis(self) -> EmotionAnalysis {
        let neutral = EmotionAnalysis::neutral();
        let valence = match self.valence {
            Some(v) if v.is_finite() => v.clamp(-1.0, 1.0),
            _ => neutral.valence,
        };
        EmotionAnalysis {
            intent: self
                .intent
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(neutral.intent),
            summary: self
                .summary
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(neutral.summary),
            valence,
            arousal: unit(self.arousal, neutral.arousal),
            anxiety: unit(self.anxiety, neutral.anxiety),
            anger: unit(self.anger, neutral.anger),
            sadness: unit(self.sadness, neutral.sadness),
            risk: RiskScores {
                self_harm: unit(self.risk_self_harm, 0.0),
                violence: unit(self.risk_violence, 0.0),
                abuse: unit(self.risk_abuse, 0.0),
            },
            continuation_need: unit(self.continuation_need, neutral.continuation_need),
            topic_seeds: clean_list(self.topic_seeds),
            avoid: clean_list(self.avoid),
            degraded: false,
        }
    }
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct EmotionAnalyzer {
    completion: Arc<dyn CompletionService>,
    mode: AnalysisMode,
}

impl EmotionAnalyzer {
    pub fn new(completion: Arc<dyn CompletionService>, mode: AnalysisMode) -> Self {
        Self { completion, mode }
    }

    pub async fn analyze(&self, history_text: &str, user_text: &str) -> EmotionAnalysis {
        if self.mode == AnalysisMode::Keyword {
            return keyword_analysis(history_text, user_text);
        }

        let mut messages = vec![
            Message::system(ANALYSIS_INSTRUCTION),
            Message::user(format!("history:\n{}\n\ninput:\n{}", history_text, user_text)),
        ];

        for attempt in 1..=2 {
            match self.attempt(messages.clone()).await {
                Ok(analysis) => return analysis,
                Err(e) => {
                    tracing::warn!("Emotion analysis attempt {} failed: {:#}", attempt, e);
                    if attempt == 1 {
                        messages.push(Message::system(CORRECTIVE_INSTRUCTION));
                    }
                }
            }
        }

        tracing::warn!("Emotion analysis fell back to neutral defaults");
        EmotionAnalysis {
            degraded: true,
            ..EmotionAnalysis::neutral()
        }
    }

    async fn attempt(&self, messages: Vec<Message>) -> Result<EmotionAnalysis> {
        let raw = self
            .completion
            .complete(messages, 0.0)
            .await
            .context("Analysis completion failed")?;
        EmotionAnalysis::from_model_reply(&raw)
    }
}

// ============================================================================
// Offline keyword scoring
// ============================================================================

const SADNESS_WORDS: &[(&str, f64)] = &[
    ("sad", 0.35),
    ("heartbroken", 0.4),
    ("crying", 0.25),
    ("cry", 0.25),
    ("hopeless", 0.4),
    ("lonely", 0.3),
    ("难过", 0.35),
    ("伤心", 0.35),
];

const ANXIETY_WORDS: &[(&str, f64)] = &[
    ("anxious", 0.35),
    ("nervous", 0.25),
    ("scared", 0.3),
    ("worried", 0.25),
    ("can't sleep", 0.25),
    ("panic", 0.3),
    ("焦虑", 0.35),
    ("害怕", 0.3),
];

const ANGER_WORDS: &[(&str, f64)] = &[
    ("angry", 0.35),
    ("furious", 0.4),
    ("pissed", 0.3),
    ("disgusting", 0.2),
    ("hate", 0.2),
    ("生气", 0.35),
];

const SELF_HARM_WORDS: &[(&str, f64)] = &[
    ("don't want to live", 0.7),
    ("end it all", 0.8),
    ("suicide", 1.0),
    ("kill myself", 1.0),
    ("cut myself", 0.8),
    ("不想活", 0.7),
];

const VIOLENCE_WORDS: &[(&str, f64)] = &[
    ("kill him", 0.8),
    ("kill her", 0.8),
    ("revenge", 0.5),
    ("stab", 0.7),
    ("beat him up", 0.7),
];

fn keyword_score(text: &str, words: &[(&str, f64)]) -> f64 {
    let total: f64 = words
        .iter()
        .filter(|(word, _)| text.contains(word))
        .map(|(_, weight)| weight)
        .sum();
    total.clamp(0.0, 1.0)
}

/// Local heuristic analysis that never calls the completion service.
pub fn keyword_analysis(history_text: &str, user_text: &str) -> EmotionAnalysis {
    let merged = format!("{}\n{}", history_text, user_text).to_lowercase();
    let current = user_text.to_lowercase();

    let sadness = keyword_score(&merged, SADNESS_WORDS);
    let anxiety = keyword_score(&merged, ANXIETY_WORDS);
    let anger = keyword_score(&merged, ANGER_WORDS);
    let self_harm = keyword_score(&merged, SELF_HARM_WORDS);
    let violence = keyword_score(&merged, VIOLENCE_WORDS);

    let intent = if current.contains('?') || current.contains('？') || current.starts_with("how ") {
        "question"
    } else if ["comfort me", "help me", "stay with me", "support"]
        .iter()
        .any(|k| current.contains(k))
    {
        "support"
    } else if sadness + anxiety + anger > 0.0 {
        "venting"
    } else {
        "chat"
    };

    let summary = [("sad", sadness), ("anx", anxiety), ("ang", anger)]
        .iter()
        .find_map(|(label, score)| {
            if *score >= 0.7 {
                Some(format!("{}-high", label))
            } else if *score >= 0.35 {
                Some(format!("{}-mid", label))
            } else {
                None
            }
        })
        .unwrap_or_else(|| "neutral".to_string());

    EmotionAnalysis {
        intent: intent.to_string(),
        summary,
        valence: (0.3 - sadness * 0.6 - anxiety * 0.4 - anger * 0.4).clamp(-1.0, 1.0),
        arousal: (0.2 + anxiety * 0.4 + anger * 0.4).clamp(0.0, 1.0),
        anxiety,
        anger,
        sadness,
        risk: RiskScores {
            self_harm,
            violence,
            abuse: 0.0,
        },
        continuation_need: if intent == "chat" { 0.5 } else { 0.3 },
        topic_seeds: Vec::new(),
        avoid: Vec::new(),
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::FragmentStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedReplies {
        replies: Mutex<VecDeque<Result<String>>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedReplies {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedReplies {
        async fn complete(&self, messages: Vec<Message>, _temperature: f32) -> Result<String> {
            self.seen.lock().unwrap().push(messages);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }

        async fn stream(&self, _messages: Vec<Message>, _temperature: f32) -> Result<FragmentStream> {
            anyhow::bail!("not used")
        }
    }

    const GOOD_REPLY: &str = r#"{"intent":"venting","summary":"sad-mid","valence":-0.4,"arousal":0.2,"anxiety":0.1,"anger":0,"sadness":0.6,"risk_self_harm":0,"risk_violence":0,"risk_abuse":0,"continuation_need":0.4,"topic_seeds":["work stress"]}"#;

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let service = ScriptedReplies::new(vec![Ok("not json".to_string()), Ok(GOOD_REPLY.to_string())]);
        let analyzer = EmotionAnalyzer::new(service.clone(), AnalysisMode::Llm);

        let analysis = analyzer.analyze("h", "u").await;
        assert_eq!(analysis.intent, "venting");
        assert!(!analysis.degraded);
        assert_eq!(service.calls(), 2);

        let second_call = &service.seen.lock().unwrap()[1];
        assert_eq!(second_call.last().unwrap().content, CORRECTIVE_INSTRUCTION);
    }

    #[tokio::test]
    async fn two_failures_fall_back_to_neutral() {
        let service = ScriptedReplies::new(vec![
            Ok("still bad".to_string()),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let analyzer = EmotionAnalyzer::new(service.clone(), AnalysisMode::Llm);

        let analysis = analyzer.analyze("h", "u").await;
        assert!(analysis.degraded);
        assert_eq!(analysis.summary, "neutral");
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn keyword_mode_makes_no_calls() {
        let service = ScriptedReplies::new(vec![]);
        let analyzer = EmotionAnalyzer::new(service.clone(), AnalysisMode::Keyword);

        let analysis = analyzer.analyze("", "I feel so sad and lonely tonight").await;
        assert!(analysis.sadness > 0.5);
        assert!(analysis.valence < 0.0);
        assert_eq!(analysis.intent, "venting");
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn out_of_range_numbers_are_clamped() {
        let analysis = EmotionAnalysis::from_model_reply(
            r#"{"valence": -3.5, "anxiety": 1.7, "anger": -0.2, "risk_self_harm": 4, "continuation_need": 2}"#,
        )
        .unwrap();
        assert_eq!(analysis.valence, -1.0);
        assert_eq!(analysis.anxiety, 1.0);
        assert_eq!(analysis.anger, 0.0);
        assert_eq!(analysis.risk.self_harm, 1.0);
        assert_eq!(analysis.continuation_need, 1.0);
        assert!(analysis.high_risk());
    }

    #[test]
    fn missing_fields_take_neutral_defaults() {
        let analysis = EmotionAnalysis::from_model_reply("```json\n{\"sadness\": 0.9}\n```").unwrap();
        let neutral = EmotionAnalysis::neutral();
        assert_eq!(analysis.sadness, 0.9);
        assert_eq!(analysis.anxiety, neutral.anxiety);
        assert_eq!(analysis.intent, neutral.intent);
        assert!(!analysis.high_risk());
    }

    #[test]
    fn wrong_field_types_are_a_parse_failure() {
        assert!(EmotionAnalysis::from_model_reply(r#"{"anxiety": "very"}"#).is_err());
    }

    #[test]
    fn intent_labels_map_to_categories() {
        assert_eq!(IntentCategory::from_label("Venting"), IntentCategory::Venting);
        assert_eq!(IntentCategory::from_label("seeking_support"), IntentCategory::Support);
        assert_eq!(IntentCategory::from_label("question"), IntentCategory::Question);
        assert_eq!(IntentCategory::from_label("general_talk"), IntentCategory::Chat);
    }
}
