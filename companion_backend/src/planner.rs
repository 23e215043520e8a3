//! Tone planning: analysis + persona bias + previous plan -> ReplyPlan.
//!
//! `ReplyPlan` is split in two. `ToneParams` holds the numeric controls that
//! are smoothed turn over turn; `PlanControls` holds everything categorical,
//! which is always replaced by the fresh value.

use serde::{Deserialize, Serialize};

use crate::analysis::{EmotionAnalysis, IntentCategory};
use crate::persona::PersonaBias;
use crate::topic::TopicDecision;

/// Weight given to the freshly computed value when smoothing.
pub const EMA_ALPHA: f64 = 0.65;

pub const SAFETY_WARMTH_FLOOR: f64 = 0.70;
pub const SAFETY_FIRMNESS_FLOOR: f64 = 0.55;

pub const MIN_SENTENCES: usize = 2;
pub const MAX_SENTENCES: usize = 6;

const BASE_STYLE_FLAGS: &[&str] = &["short_paragraphs", "concrete_support"];
const BASE_BANNED_PHRASES: &[&str] = &["as an AI", "as a language model", "I can't guarantee"];
const SAFETY_BANNED_PHRASES: &[&str] = &["you can only rely on me", "you can't do this without me"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneParams {
    pub warmth: f64,
    pub calmness: f64,
    pub firmness: f64,
    pub verbosity: f64,
    pub empathy: f64,
    pub directness: f64,
}

impl ToneParams {
    /// Combine two tone sets field by field.
    pub fn zip_with(&self, other: &ToneParams, f: impl Fn(f64, f64) -> f64) -> ToneParams {
        ToneParams {
            warmth: f(self.warmth, other.warmth),
            calmness: f(self.calmness, other.calmness),
            firmness: f(self.firmness, other.firmness),
            verbosity: f(self.verbosity, other.verbosity),
            empathy: f(self.empathy, other.empathy),
            directness: f(self.directness, other.directness),
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> ToneParams {
        self.zip_with(self, |v, _| f(v))
    }

    pub fn clamped(&self) -> ToneParams {
        self.map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.5 })
    }

    fn with_bias(&self, bias: &PersonaBias) -> ToneParams {
        ToneParams {
            warmth: self.warmth + bias.warmth,
            calmness: self.calmness + bias.calmness,
            firmness: self.firmness + bias.firmness,
            verbosity: self.verbosity + bias.verbosity,
            empathy: self.empathy + bias.empathy,
            directness: self.directness + bias.directness,
        }
    }

    fn with_safety_floors(&self) -> ToneParams {
        ToneParams {
            warmth: self.warmth.max(SAFETY_WARMTH_FLOOR),
            firmness: self.firmness.max(SAFETY_FIRMNESS_FLOOR),
            ..*self
        }
    }

    pub fn all(&self) -> [f64; 6] {
        [
            self.warmth,
            self.calmness,
            self.firmness,
            self.verbosity,
            self.empathy,
            self.directness,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanControls {
    pub safety_mode: bool,
    pub style_flags: Vec<String>,
    pub banned_phrases: Vec<String>,
    pub min_sentences: usize,
    pub max_sentences: usize,
    pub ask_question: bool,
    /// The user's message matched a distress pattern; set by the orchestrator
    #[serde(default)]
    pub user_distress: bool,
    #[serde(default)]
    pub topic: TopicDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPlan {
    pub tone: ToneParams,
    pub controls: PlanControls,
}

fn raw_tone(analysis: &EmotionAnalysis) -> ToneParams {
    let intent_adjust = match analysis.intent_category() {
        IntentCategory::Venting | IntentCategory::Support => 0.10,
        IntentCategory::Question => 0.0,
        IntentCategory::Chat => -0.05,
    };

    ToneParams {
        calmness: 0.55 + analysis.anxiety * 0.35 + analysis.anger * 0.20,
        warmth: 0.55 + (-analysis.valence).max(0.0) * 0.25 + analysis.sadness * 0.20,
        firmness: 0.30 + analysis.anger * 0.25,
        verbosity: 0.45 + analysis.sadness * 0.15 - analysis.anger * 0.15 + intent_adjust,
        empathy: 0.65 + analysis.sadness * 0.20 + analysis.anxiety * 0.10,
        directness: 0.50 + analysis.anger * 0.10,
    }
}

/// Tone for this turn before smoothing: formula, persona bias, protective floors, clamp.
pub fn fresh_tone(analysis: &EmotionAnalysis, bias: &PersonaBias) -> ToneParams {
    let tone = raw_tone(analysis).with_bias(bias);
    let tone = if analysis.high_risk() {
        tone.with_safety_floors()
    } else {
        tone
    };
    tone.clamped()
}

pub fn smooth(fresh: &ToneParams, previous: Option<&ToneParams>) -> ToneParams {
    match previous {
        None => *fresh,
        Some(prev) => fresh
            .zip_with(prev, |new, old| EMA_ALPHA * new + (1.0 - EMA_ALPHA) * old)
            .clamped(),
    }
}

fn sentence_bounds(verbosity: f64) -> (usize, usize) {
    let max = (2.0 + 4.0 * verbosity).round() as usize;
    (MIN_SENTENCES, max.clamp(MIN_SENTENCES, MAX_SENTENCES))
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing.eq_ignore_ascii_case(item)) {
        list.push(item.to_string());
    }
}

/// Derive this turn's plan. Pure and deterministic.
pub fn compute_plan(
    analysis: &EmotionAnalysis,
    persona_bias: &PersonaBias,
    previous_plan: Option<&ReplyPlan>,
) -> ReplyPlan {
    let safety_mode = analysis.high_risk();
    let fresh = fresh_tone(analysis, persona_bias);
    let mut tone = smooth(&fresh, previous_plan.map(|p| &p.tone));
    if safety_mode {
        tone = tone.with_safety_floors();
    }

    let mut style_flags: Vec<String> = BASE_STYLE_FLAGS.iter().map(|s| s.to_string()).collect();
    let mut banned_phrases: Vec<String> =
        BASE_BANNED_PHRASES.iter().map(|s| s.to_string()).collect();
    if safety_mode {
        style_flags.push("safety_first".to_string());
        for phrase in SAFETY_BANNED_PHRASES {
            push_unique(&mut banned_phrases, phrase);
        }
    }
    for phrase in &analysis.avoid {
        push_unique(&mut banned_phrases, phrase);
    }

    let (min_sentences, max_sentences) = sentence_bounds(tone.verbosity);

    ReplyPlan {
        tone,
        controls: PlanControls {
            safety_mode,
            style_flags,
            banned_phrases,
            min_sentences,
            max_sentences,
            ask_question: analysis.continuation_need > 0.35,
            user_distress: false,
            topic: TopicDecision::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::RiskScores;

    fn analysis() -> EmotionAnalysis {
        EmotionAnalysis::neutral()
    }

    fn no_bias() -> PersonaBias {
        PersonaBias::default()
    }

    #[test]
    fn calmness_increases_with_anxiety() {
        let low = EmotionAnalysis {
            anxiety: 0.1,
            ..analysis()
        };
        let high = EmotionAnalysis {
            anxiety: 0.9,
            ..analysis()
        };
        let low_plan = compute_plan(&low, &no_bias(), None);
        let high_plan = compute_plan(&high, &no_bias(), None);
        assert!(high_plan.tone.calmness > low_plan.tone.calmness);
    }

    #[test]
    fn sadness_raises_warmth_and_venting_raises_verbosity() {
        let sad = EmotionAnalysis {
            sadness: 0.8,
            anger: 0.1,
            valence: -0.5,
            intent: "venting".to_string(),
            ..analysis()
        };
        let angry = EmotionAnalysis {
            sadness: 0.1,
            anger: 0.9,
            intent: "question".to_string(),
            ..analysis()
        };
        let sad_plan = compute_plan(&sad, &no_bias(), None);
        let angry_plan = compute_plan(&angry, &no_bias(), None);
        assert!(sad_plan.tone.warmth > angry_plan.tone.warmth);
        assert!(sad_plan.tone.verbosity > angry_plan.tone.verbosity);
        assert!(angry_plan.tone.firmness > sad_plan.tone.firmness);
    }

    #[test]
    fn first_turn_is_unsmoothed() {
        let input = EmotionAnalysis {
            anxiety: 0.8,
            sadness: 0.6,
            ..analysis()
        };
        let plan = compute_plan(&input, &no_bias(), None);
        assert_eq!(plan.tone, fresh_tone(&input, &no_bias()));
    }

    #[test]
    fn safety_mode_floors_and_extends_bans() {
        let risky = EmotionAnalysis {
            risk: RiskScores {
                self_harm: 0.5,
                violence: 0.0,
                abuse: 0.0,
            },
            ..analysis()
        };
        let bias = PersonaBias {
            warmth: -0.3,
            firmness: -0.3,
            ..PersonaBias::default()
        };
        let calm_previous = compute_plan(&analysis(), &PersonaBias::default(), None);
        let plan = compute_plan(&risky, &bias, Some(&calm_previous));

        assert!(plan.controls.safety_mode);
        assert!(plan.tone.warmth >= SAFETY_WARMTH_FLOOR);
        assert!(plan.tone.firmness >= SAFETY_FIRMNESS_FLOOR);
        assert!(plan.controls.style_flags.iter().any(|f| f == "safety_first"));
        assert!(plan
            .controls
            .banned_phrases
            .iter()
            .any(|p| p == "you can only rely on me"));
    }

    #[test]
    fn categorical_fields_are_never_smoothed() {
        let risky = EmotionAnalysis {
            risk: RiskScores {
                self_harm: 0.0,
                violence: 0.9,
                abuse: 0.0,
            },
            ..analysis()
        };
        let risky_plan = compute_plan(&risky, &no_bias(), None);
        let calm_plan = compute_plan(&analysis(), &no_bias(), Some(&risky_plan));
        assert!(risky_plan.controls.safety_mode);
        assert!(!calm_plan.controls.safety_mode);
        assert!(!calm_plan.controls.style_flags.iter().any(|f| f == "safety_first"));
    }

    #[test]
    fn smoothing_converges_monotonically_without_overshoot() {
        const EPS: f64 = 1e-12;
        let start = EmotionAnalysis {
            anger: 0.9,
            anxiety: 0.9,
            ..analysis()
        };
        let target_input = EmotionAnalysis {
            sadness: 0.7,
            valence: -0.6,
            intent: "venting".to_string(),
            ..analysis()
        };
        let target = fresh_tone(&target_input, &no_bias());

        let mut plan = compute_plan(&start, &no_bias(), None);
        let mut prev_gap = plan.tone.zip_with(&target, |v, t| (v - t).abs());
        for _ in 0..40 {
            let next = compute_plan(&target_input, &no_bias(), Some(&plan));
            for ((old, new), goal) in plan
                .tone
                .all()
                .iter()
                .zip(next.tone.all().iter())
                .zip(target.all().iter())
            {
                // moves toward the goal and never crosses it
                if old <= goal {
                    assert!(*new >= old - EPS && *new <= goal + EPS);
                } else {
                    assert!(*new <= old + EPS && *new >= goal - EPS);
                }
            }
            let gap = next.tone.zip_with(&target, |v, t| (v - t).abs());
            for (g, p) in gap.all().iter().zip(prev_gap.all().iter()) {
                assert!(g <= &(p + EPS));
            }
            prev_gap = gap;
            plan = next;
        }
        for g in prev_gap.all() {
            assert!(g < 1e-6);
        }
    }

    #[test]
    fn every_field_stays_in_domain_under_extreme_bias() {
        let bias = PersonaBias {
            warmth: 5.0,
            calmness: -5.0,
            firmness: 5.0,
            verbosity: -5.0,
            empathy: 5.0,
            directness: -5.0,
        };
        let plan = compute_plan(&analysis(), &bias, None);
        for v in plan.tone.all() {
            assert!((0.0..=1.0).contains(&v));
        }
        assert!(plan.controls.min_sentences <= plan.controls.max_sentences);
        assert!(plan.controls.max_sentences <= MAX_SENTENCES);
    }

    #[test]
    fn analysis_avoid_phrases_are_banned_once() {
        let input = EmotionAnalysis {
            avoid: vec!["calm down".to_string(), "As an AI".to_string()],
            ..analysis()
        };
        let plan = compute_plan(&input, &no_bias(), None);
        let bans = &plan.controls.banned_phrases;
        assert!(bans.iter().any(|p| p == "calm down"));
        assert_eq!(
            bans.iter().filter(|p| p.eq_ignore_ascii_case("as an AI")).count(),
            1
        );
    }
}
