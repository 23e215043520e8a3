use chrono::{DateTime, Duration, Utc};

use super::{clamp_score, Confidence, RelationshipState, Signal};
use crate::config::RelationshipConfig;

/// Fixed priority: earlier entries win.
const NEGATIVE_PRIORITY: [Signal; 3] = [
    Signal::BoundaryPressure,
    Signal::DependencyAttempt,
    Signal::ConflictPattern,
];
const POSITIVE_PRIORITY: [Signal; 2] = [Signal::StableInteraction, Signal::EmotionalSupport];

/// Streak length → one-off reward.
const STREAK_REWARDS: [(u32, f64); 3] = [(4, 1.0), (9, 2.0), (15, 3.0)];

/// Lower-confidence negatives needed before the medium penalty lands.
const DEBOUNCE_THRESHOLD: u32 = 2;

fn score_for(signal: Signal, confidence: Confidence) -> f64 {
    let (high, medium, low) = match signal {
        Signal::BoundaryPressure => (-1.8, -1.1, -0.5),
        Signal::DependencyAttempt => (-1.4, -0.9, -0.4),
        Signal::ConflictPattern => (-1.2, -0.7, -0.3),
        Signal::StableInteraction => (0.9, 0.6, 0.2),
        Signal::EmotionalSupport => (0.5, 0.3, 0.1),
        Signal::NeutralInteraction => (0.0, 0.0, 0.0),
    };
    match confidence {
        Confidence::High => high,
        Confidence::Medium => medium,
        Confidence::Low => low,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    /// Already bounded by the distance to the nearer score limit
    pub delta: f64,
    pub note: String,
}

pub struct AffinityJudge {
    streak_reward_cooldown: Duration,
    risk_buffer_decay: Duration,
}

impl Default for AffinityJudge {
    fn default() -> Self {
        Self::new(&RelationshipConfig::default())
    }
}

impl AffinityJudge {
    pub fn new(config: &RelationshipConfig) -> Self {
        Self {
            streak_reward_cooldown: Duration::hours(config.streak_reward_cooldown_hours),
            risk_buffer_decay: Duration::days(config.risk_buffer_decay_days),
        }
    }

    /// Score one evaluation. Mutates the streak and risk buffer; the caller
    /// applies the returned delta.
    pub fn evaluate(
        &self,
        state: &mut RelationshipState,
        signals: &[Signal],
        confidence: Confidence,
        now: DateTime<Utc>,
    ) -> JudgeOutcome {
        let mut delta = 0.0;
        let mut notes: Vec<String> = Vec::new();

        if let Some(updated_at) = state.risk_buffer.updated_at {
            if now - updated_at > self.risk_buffer_decay {
                state.risk_buffer.clear_counters();
            }
        }

        let negative = NEGATIVE_PRIORITY.iter().copied().find(|s| signals.contains(s));
        let positive = POSITIVE_PRIORITY.iter().copied().find(|s| signals.contains(s));

        if let Some(signal) = negative {
            state.stable_streak = 0;
            if confidence == Confidence::High {
                delta += score_for(signal, Confidence::High);
                notes.push(format!("high_negative:{}", signal));
            } else {
                state.risk_buffer.updated_at = Some(now);
                if let Some(counter) = state.risk_buffer.counter_mut(signal) {
                    *counter += 1;
                    if *counter >= DEBOUNCE_THRESHOLD {
                        *counter = 0;
                        delta += score_for(signal, Confidence::Medium);
                        notes.push(format!("buffer_trigger:{}", signal));
                    } else {
                        notes.push(format!("buffer_accumulate:{}:{}", signal, *counter));
                    }
                }
            }
        } else {
            if let Some(signal) = positive {
                delta += score_for(signal, confidence);
                notes.push(format!("positive:{}", signal));
            }

            if signals.contains(&Signal::StableInteraction) {
                state.stable_streak += 1;
                let streak = state.stable_streak;
                if let Some((_, reward)) = STREAK_REWARDS.iter().find(|(at, _)| *at == streak) {
                    let cooled_down = state
                        .last_streak_reward_at
                        .map(|last| now - last >= self.streak_reward_cooldown)
                        .unwrap_or(true);
                    if cooled_down {
                        delta += reward;
                        state.last_streak_reward_at = Some(now);
                        notes.push(format!("streak_reward:{}", streak));
                    } else {
                        notes.push("streak_reward_cooldown".to_string());
                    }
                }
            } else {
                state.stable_streak = 0;
            }
        }

        let current = state.affinity_score;
        let bounded = clamp_score(current + delta);
        let delta = round2(bounded - current);

        let note = if notes.is_empty() {
            "no_change".to_string()
        } else {
            notes.join(";")
        };
        tracing::debug!(
            "Affinity evaluation for {}:{}: delta {:+.2} ({})",
            state.user_id,
            state.persona_id,
            delta,
            note
        );

        JudgeOutcome { delta, note }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn state() -> RelationshipState {
        RelationshipState::new("u1", "linyu")
    }

    #[test]
    fn high_confidence_negative_applies_immediately() {
        let judge = AffinityJudge::default();
        let mut s = state();
        s.stable_streak = 3;
        let out = judge.evaluate(&mut s, &[Signal::BoundaryPressure], Confidence::High, t0());
        assert_eq!(out.delta, -1.8);
        assert_eq!(out.note, "high_negative:boundary_pressure");
        assert_eq!(s.stable_streak, 0);
    }

    #[test]
    fn negative_priority_beats_positive() {
        let judge = AffinityJudge::default();
        let mut s = state();
        let out = judge.evaluate(
            &mut s,
            &[Signal::StableInteraction, Signal::ConflictPattern, Signal::DependencyAttempt],
            Confidence::High,
            t0(),
        );
        assert_eq!(out.delta, -1.4);
        assert_eq!(out.note, "high_negative:dependency_attempt");
    }

    #[test]
    fn lower_confidence_negatives_are_debounced() {
        let judge = AffinityJudge::default();
        let mut s = state();

        let first = judge.evaluate(&mut s, &[Signal::DependencyAttempt], Confidence::Medium, t0());
        assert_eq!(first.delta, 0.0);
        assert_eq!(first.note, "buffer_accumulate:dependency_attempt:1");
        assert_eq!(s.risk_buffer.dependency_attempt, 1);

        let second = judge.evaluate(
            &mut s,
            &[Signal::DependencyAttempt],
            Confidence::Low,
            t0() + Duration::hours(1),
        );
        assert_eq!(second.delta, -0.9);
        assert_eq!(second.note, "buffer_trigger:dependency_attempt");
        assert_eq!(s.risk_buffer.dependency_attempt, 0);
    }

    #[test]
    fn two_medium_boundary_pressure_calls_debounce_then_penalize() {
        let judge = AffinityJudge::default();
        let mut s = state();

        let first = judge.evaluate(&mut s, &[Signal::BoundaryPressure], Confidence::Medium, t0());
        assert_eq!(first.delta, 0.0);
        assert_eq!(s.risk_buffer.boundary_pressure, 1);

        let second = judge.evaluate(
            &mut s,
            &[Signal::BoundaryPressure],
            Confidence::Medium,
            t0() + Duration::minutes(30),
        );
        assert_eq!(second.delta, -1.1);
        assert_eq!(second.note, "buffer_trigger:boundary_pressure");
        assert_eq!(s.risk_buffer.boundary_pressure, 0);
    }

    #[test]
    fn debounce_counters_decay_after_idle_week() {
        let judge = AffinityJudge::default();
        let mut s = state();
        judge.evaluate(&mut s, &[Signal::ConflictPattern], Confidence::Low, t0());
        let later = judge.evaluate(
            &mut s,
            &[Signal::ConflictPattern],
            Confidence::Low,
            t0() + Duration::days(8),
        );
        assert_eq!(later.delta, 0.0);
        assert_eq!(later.note, "buffer_accumulate:conflict_pattern:1");
    }

    #[test]
    fn positive_uses_confidence_table() {
        let judge = AffinityJudge::default();
        let mut s = state();
        let out = judge.evaluate(&mut s, &[Signal::EmotionalSupport], Confidence::Medium, t0());
        assert_eq!(out.delta, 0.3);
        assert_eq!(s.stable_streak, 0);

        let neutral = judge.evaluate(&mut s, &[Signal::NeutralInteraction], Confidence::Low, t0());
        assert_eq!(neutral.delta, 0.0);
        assert_eq!(neutral.note, "no_change");
    }

    #[test]
    fn delta_never_crosses_a_boundary() {
        let judge = AffinityJudge::default();
        let mut s = state();
        s.affinity_score = 0.5;
        let out = judge.evaluate(&mut s, &[Signal::BoundaryPressure], Confidence::High, t0());
        assert_eq!(out.delta, -0.5);
        s.apply(out.delta);
        assert_eq!(s.affinity_score, 0.0);

        let again = judge.evaluate(&mut s, &[Signal::BoundaryPressure], Confidence::High, t0());
        assert_eq!(again.delta, 0.0);
    }

    #[test]
    fn streak_rewards_land_at_milestones_over_sixty_evaluations() {
        let judge = AffinityJudge::default();
        let mut s = state();
        let mut rewarded_at = Vec::new();
        let mut last = None;

        for day in 0..60 {
            let now = t0() + Duration::days(day);
            let out = judge.evaluate(&mut s, &[Signal::StableInteraction], Confidence::High, now);
            if out.note.contains("streak_reward:") {
                rewarded_at.push(s.stable_streak);
            }
            s.apply(out.delta);
            assert!(s.affinity_score <= 100.0);
            last = Some(out);
        }

        assert_eq!(rewarded_at, vec![4, 9, 15]);
        assert!(s.affinity_score > 99.9);
        assert_eq!(last.map(|o| o.delta), Some(0.0));
    }

    #[test]
    fn medium_confidence_streak_from_fifty_rewards_at_milestones() {
        let judge = AffinityJudge::default();
        let mut s = state();
        assert_eq!(s.affinity_score, 50.0);
        let mut rewarded_at = Vec::new();
        let mut previous = s.affinity_score;

        for evaluation in 1..=60u32 {
            let now = t0() + Duration::days(i64::from(evaluation));
            let out = judge.evaluate(&mut s, &[Signal::StableInteraction], Confidence::Medium, now);
            if out.note.contains("streak_reward:") {
                rewarded_at.push(evaluation);
            }
            let score = s.apply(out.delta);
            assert!(score >= previous);
            assert!(score <= 100.0);
            previous = score;
        }

        assert_eq!(rewarded_at, vec![4, 9, 15]);
        // 60 × 0.6 plus 1 + 2 + 3 in rewards
        assert!((s.affinity_score - 92.0).abs() < 1e-6);
    }

    #[test]
    fn streak_reward_respects_cooldown() {
        let judge = AffinityJudge::default();
        let mut s = state();
        s.stable_streak = 8;
        s.last_streak_reward_at = Some(t0() - Duration::hours(10));
        let out = judge.evaluate(&mut s, &[Signal::StableInteraction], Confidence::Low, t0());
        assert_eq!(s.stable_streak, 9);
        assert_eq!(out.delta, 0.2);
        assert_eq!(out.note, "positive:stable_interaction;streak_reward_cooldown");
    }

    #[test]
    fn missing_stable_signal_resets_streak() {
        let judge = AffinityJudge::default();
        let mut s = state();
        s.stable_streak = 5;
        judge.evaluate(&mut s, &[Signal::EmotionalSupport], Confidence::High, t0());
        assert_eq!(s.stable_streak, 0);
    }
}
