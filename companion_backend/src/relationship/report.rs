//! Operator view of one relationship: state, recent evaluations and a
//! seven-day rollup.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{EvalLogEntry, RelationshipState};

const RECENT_LOG_ENTRIES: usize = 10;
const STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub eval_count: usize,
    pub net_delta: f64,
    pub signals_count: BTreeMap<String, usize>,
    pub confidence_count: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipReport {
    pub user_id: String,
    pub persona_id: String,
    pub state: RelationshipState,
    pub recent_eval_log: Vec<EvalLogEntry>,
    pub stats_7d: WindowStats,
}

pub fn build_report(state: &RelationshipState, now: DateTime<Utc>) -> RelationshipReport {
    let start = state.eval_log.len().saturating_sub(RECENT_LOG_ENTRIES);
    let window_start = now - Duration::days(STATS_WINDOW_DAYS);

    let mut signals_count = BTreeMap::new();
    let mut confidence_count: BTreeMap<String, usize> = ["low", "medium", "high"]
        .iter()
        .map(|c| (c.to_string(), 0))
        .collect();
    let mut eval_count = 0;
    let mut net_delta = 0.0;

    for entry in state.eval_log.iter().filter(|e| e.at >= window_start) {
        eval_count += 1;
        net_delta += entry.delta;
        for signal in &entry.signals {
            *signals_count.entry(signal.to_string()).or_insert(0) += 1;
        }
        *confidence_count
            .entry(entry.confidence.as_str().to_string())
            .or_insert(0) += 1;
    }

    RelationshipReport {
        user_id: state.user_id.clone(),
        persona_id: state.persona_id.clone(),
        state: state.clone(),
        recent_eval_log: state.eval_log[start..].to_vec(),
        stats_7d: WindowStats {
            eval_count,
            net_delta: (net_delta * 100.0).round() / 100.0,
            signals_count,
            confidence_count,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::{Confidence, EvalTrigger, Signal};

    fn entry(at: DateTime<Utc>, signal: Signal, confidence: Confidence, delta: f64) -> EvalLogEntry {
        EvalLogEntry {
            at,
            signals: vec![signal],
            confidence,
            delta,
            score_after: 50.0,
            note: String::new(),
            trigger: EvalTrigger::MessageCount,
        }
    }

    #[test]
    fn report_windows_recent_entries() {
        let now = Utc::now();
        let mut state = RelationshipState::new("u1", "linyu");
        for i in 0..12 {
            state.eval_log.push(entry(
                now - Duration::days(20 - i),
                Signal::NeutralInteraction,
                Confidence::Low,
                0.0,
            ));
        }
        state
            .eval_log
            .push(entry(now - Duration::days(2), Signal::StableInteraction, Confidence::High, 0.9));
        state
            .eval_log
            .push(entry(now - Duration::hours(3), Signal::ConflictPattern, Confidence::High, -1.2));

        let report = build_report(&state, now);
        assert_eq!(report.recent_eval_log.len(), 10);
        assert_eq!(report.recent_eval_log.last().unwrap().delta, -1.2);
        assert_eq!(report.stats_7d.eval_count, 2);
        assert_eq!(report.stats_7d.net_delta, -0.3);
        assert_eq!(report.stats_7d.signals_count.get("conflict_pattern"), Some(&1));
        assert_eq!(report.stats_7d.signals_count.get("neutral_interaction"), None);
        assert_eq!(report.stats_7d.confidence_count.get("high"), Some(&2));
        assert_eq!(report.stats_7d.confidence_count.get("low"), Some(&0));
    }

    #[test]
    fn empty_log_reports_zeroes() {
        let report = build_report(&RelationshipState::new("u", "p"), Utc::now());
        assert!(report.recent_eval_log.is_empty());
        assert_eq!(report.stats_7d.eval_count, 0);
        assert_eq!(report.stats_7d.confidence_count.len(), 3);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"]["affinity_score"], 50.0);
    }
}
