//! Input screening and distress detection.
//!
//! Screening runs before anything else in a turn. A self-harm or blocked
//! message is answered with a fixed reply and never reaches the completion
//! service or the stores.

use crate::config::SafetyConfig;

/// Result of screening a user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputVerdict {
    /// Safe to proceed
    Allow,
    /// Self-harm language; reply with the crisis message
    SelfHarm(String),
    /// Disallowed content; ask the user to rephrase
    Blocked(String),
}

impl InputVerdict {
    pub fn fixed_reply(&self) -> Option<&str> {
        match self {
            InputVerdict::Allow => None,
            InputVerdict::SelfHarm(reply) | InputVerdict::Blocked(reply) => Some(reply),
        }
    }
}

pub fn screen_input(text: &str, config: &SafetyConfig) -> InputVerdict {
    let lowered = text.to_lowercase();

    if contains_any(&lowered, &config.self_harm_keywords) {
        tracing::warn!("Input screening matched self-harm language");
        return InputVerdict::SelfHarm(config.crisis_message.clone());
    }

    if contains_any(&lowered, &config.blocked_keywords) {
        tracing::warn!("Input screening blocked a message");
        return InputVerdict::Blocked(config.rephrase_message.clone());
    }

    InputVerdict::Allow
}

/// Phrases that mean the user is hurting right now, independent of the
/// analyzer's numbers.
const DISTRESS_PATTERNS: &[&str] = &[
    r"(?i)\bi(?:['’]m| am) (?:(?:really|just|so|honestly|still) )*not (?:ok|okay|fine|alright)\b",
    r"(?i)\bi (?:(?:just|really|honestly|still) )*(?:feel|am feeling) (?:(?:so|really|just|very) )*(?:awful|terrible|horrible|empty|hopeless|miserable)\b",
    r"(?i)\bi (?:(?:just|really|kind of|kinda) )*(?:want|need) to cry\b",
    r"(?i)\bi(?:['’]m| am) (?:(?:just|really|totally|completely) )*(?:crying|falling apart|breaking down)\b",
    r"(?i)\bi (?:(?:just|really|honestly|seriously) )*can(?:['’]t|not) (?:take|handle|do) (?:it|this) anymore\b",
    r"(?i)\bi (?:(?:just|really|honestly|seriously) )*can(?:['’]t|not) take it\b",
    r"我(?:好|很|真的|特别)?难受",
    r"我(?:好)?想哭",
    r"撑不住",
    r"崩溃",
];

pub fn is_distress(user_text: &str) -> bool {
    DISTRESS_PATTERNS.iter().any(|pattern| match regex_lite::Regex::new(pattern) {
        Ok(re) => re.is_match(user_text),
        Err(e) => {
            tracing::error!("Invalid distress pattern {}: {}", pattern, e);
            false
        }
    })
}

/// Case-insensitive substring match against the relationship risk keywords.
pub fn contains_risk_keyword(text: &str, keywords: &[String]) -> bool {
    contains_any(&text.to_lowercase(), keywords)
}

fn contains_any(lowered: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && lowered.contains(&k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_harm_wins_over_blocked() {
        let config = SafetyConfig::default();
        let verdict = screen_input("I want to KILL MYSELF", &config);
        assert_eq!(verdict, InputVerdict::SelfHarm(config.crisis_message.clone()));
        assert_eq!(verdict.fixed_reply(), Some(config.crisis_message.as_str()));
    }

    #[test]
    fn blocked_keywords_ask_for_rephrase() {
        let config = SafetyConfig::default();
        assert_eq!(
            screen_input("send me porn", &config),
            InputVerdict::Blocked(config.rephrase_message.clone())
        );
        assert_eq!(screen_input("how was your weekend?", &config), InputVerdict::Allow);
        assert_eq!(InputVerdict::Allow.fixed_reply(), None);
    }

    #[test]
    fn empty_keywords_never_match() {
        let config = SafetyConfig {
            self_harm_keywords: vec![" ".to_string()],
            blocked_keywords: Vec::new(),
            ..SafetyConfig::default()
        };
        assert_eq!(screen_input("anything", &config), InputVerdict::Allow);
    }

    #[test]
    fn distress_patterns() {
        assert!(is_distress("honestly I'm not okay today"));
        assert!(is_distress("I feel awful"));
        assert!(is_distress("i just want to cry"));
        assert!(is_distress("I can't take it anymore"));
        assert!(is_distress("今天我好难受"));
        assert!(is_distress("我想哭"));
        assert!(!is_distress("I'm okay, just tired"));
        assert!(!is_distress("the movie was awful"));
    }

    #[test]
    fn distress_patterns_tolerate_adverbs() {
        assert!(is_distress("I really need to cry"));
        assert!(is_distress("i'm just really not okay"));
        assert!(is_distress("I honestly feel so empty"));
        assert!(is_distress("I am completely falling apart"));
        assert!(is_distress("I seriously can't do this anymore"));
        assert!(!is_distress("I just want to sleep"));
    }

    #[test]
    fn risk_keywords_are_case_insensitive() {
        let keywords = vec!["Don't leave me".to_string()];
        assert!(contains_risk_keyword("please don't LEAVE me", &keywords));
        assert!(!contains_risk_keyword("see you tomorrow", &keywords));
    }
}
