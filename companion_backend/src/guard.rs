//! Post-generation enforcement of the reply plan.
//!
//! `enforce` is idempotent: running it on its own output returns the same
//! text. Every sentence it emits ends in a terminator so a second split sees
//! the same sentences.

use crate::planner::ReplyPlan;

const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', '」', '』'];

/// Comfort filler that reads as canned no matter what the user said.
const FILLER_PHRASES: &[&str] = &[
    "you're not alone",
    "you are not alone",
    "everything will be okay",
    "everything will be fine",
    "everything happens for a reason",
    "sending hugs",
    "i'll always be here for you",
    "i will always be here for you",
    "一切都会好起来的",
];

const SAFETY_SUBSTITUTIONS: &[(&str, &str)] = &[
    (r"(?i)\byou must\b", "you could try to"),
    (r"(?i)\byou have to\b", "maybe you could"),
    (r"(?i)\byou can only\b", "one option is to"),
    (r"(?i)\byou should\b", "you might"),
    ("必须", "尽量"),
    ("只能", "可以先"),
];

const SELF_DISCLOSURE_PREFIXES: &[&str] = &[
    "i ", "i'm", "i’m", "i've", "i’ve", "i'd", "i’d", "me too", "my ", "我也", "我最近", "我以前", "我之前",
];

const USER_CENTRED_PREFIXES: &[&str] = &[
    "you", "it sounds", "that sounds", "sounds like", "it seems", "你", "听起来", "看起来",
];

const ACKNOWLEDGEMENT: &str = "It sounds like you're carrying a lot right now.";
const ACKNOWLEDGEMENT_ZH: &str = "听起来你现在承受了很多。";
const DISTRESS_QUESTION: &str = "What feels heaviest for you right now?";
const DISTRESS_QUESTION_ZH: &str = "现在最让你难受的是哪一部分？";
const FALLBACK_REPLY: &str = "I'm here, and I'm listening.";
const PADDING: &str = "Take your time.";

pub fn enforce(raw: &str, plan: &ReplyPlan) -> String {
    let controls = &plan.controls;
    let cleaned = strip_stage_directions(raw);
    let chinese = contains_cjk(&cleaned);

    let banned: Vec<String> = controls
        .banned_phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .chain(FILLER_PHRASES.iter().map(|p| p.to_string()))
        .filter(|p| !p.is_empty())
        .collect();

    let mut sentences: Vec<String> = split_sentences(&cleaned)
        .into_iter()
        .filter(|s| {
            let lowered = s.to_lowercase();
            !banned.iter().any(|b| lowered.contains(b.as_str()))
        })
        .collect();

    if controls.safety_mode {
        sentences = sentences.iter().map(|s| soften(s)).collect();
    }

    if controls.user_distress {
        sentences = apply_distress_rules(sentences, chinese);
    }

    if sentences.is_empty() {
        sentences.push(FALLBACK_REPLY.to_string());
    }

    let max = controls.max_sentences.max(1);
    let min = controls.min_sentences.min(max);
    sentences = truncate_keeping_question(sentences, max);

    if sentences.len() < min && !sentences.iter().any(|s| s == PADDING) {
        let at = match sentences.last() {
            Some(last) if is_question(last) => sentences.len() - 1,
            _ => sentences.len(),
        };
        sentences.insert(at, PADDING.to_string());
    }

    join_sentences(&sentences)
}

/// Remove (..), （..）, [..], 【..】 and *..* spans, innermost first.
pub fn strip_stage_directions(text: &str) -> String {
    let patterns = [
        r"\([^()]*\)",
        r"（[^（）]*）",
        r"\[[^\[\]]*\]",
        r"【[^【】]*】",
        r"\*[^*\n]+\*",
    ];
    let compiled: Vec<regex_lite::Regex> = patterns
        .iter()
        .filter_map(|p| regex_lite::Regex::new(p).ok())
        .collect();

    let mut current = text.to_string();
    loop {
        let next = compiled
            .iter()
            .fold(current.clone(), |acc, re| re.replace_all(&acc, " ").into_owned());
        if next == current {
            break;
        }
        current = next;
    }

    current.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split after runs of sentence terminators (plus trailing closing quotes).
/// An ASCII terminator only ends a sentence before whitespace or the end of
/// the text, so decimals and domain names stay whole. Every returned
/// sentence is trimmed and terminated.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if TERMINATORS.contains(&c) {
            let mut full_width = is_full_width_terminator(c);
            while let Some(&next) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    full_width |= is_full_width_terminator(next);
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if full_width || at_boundary {
                push_sentence(&mut sentences, &current);
                current.clear();
            }
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn is_full_width_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| TERMINATORS.contains(&c) || CLOSERS.contains(&c)) {
        return;
    }
    if is_terminated(trimmed) {
        sentences.push(trimmed.to_string());
    } else if trimmed.chars().last().map(is_cjk).unwrap_or(false) {
        sentences.push(format!("{}。", trimmed));
    } else {
        sentences.push(format!("{}.", trimmed));
    }
}

fn is_terminated(sentence: &str) -> bool {
    sentence
        .trim_end_matches(CLOSERS)
        .ends_with(TERMINATORS)
}

pub fn is_question(sentence: &str) -> bool {
    sentence.trim_end_matches(CLOSERS).ends_with(['?', '？'])
}

fn soften(sentence: &str) -> String {
    let softened = SAFETY_SUBSTITUTIONS.iter().fold(sentence.to_string(), |acc, (pattern, replacement)| {
        match regex_lite::Regex::new(pattern) {
            Ok(re) => re.replace_all(&acc, *replacement).into_owned(),
            Err(_) => acc,
        }
    });
    capitalize_first(&softened)
}

fn capitalize_first(sentence: &str) -> String {
    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            format!("{}{}", first.to_ascii_uppercase(), chars.as_str())
        }
        _ => sentence.to_string(),
    }
}

fn starts_with_any(sentence: &str, prefixes: &[&str]) -> bool {
    let lowered = sentence.to_lowercase();
    prefixes.iter().any(|p| lowered.starts_with(p))
}

fn apply_distress_rules(sentences: Vec<String>, chinese: bool) -> Vec<String> {
    let mut sentences: Vec<String> = sentences
        .into_iter()
        .skip_while(|s| starts_with_any(s, SELF_DISCLOSURE_PREFIXES))
        .collect();

    let user_centred = sentences
        .first()
        .map(|s| starts_with_any(s, USER_CENTRED_PREFIXES))
        .unwrap_or(false);
    if !user_centred {
        let ack = if chinese { ACKNOWLEDGEMENT_ZH } else { ACKNOWLEDGEMENT };
        sentences.insert(0, ack.to_string());
    }

    let mut seen_question = false;
    sentences.retain(|s| {
        if !is_question(s) {
            return true;
        }
        if seen_question {
            return false;
        }
        seen_question = true;
        true
    });

    if !seen_question {
        let question = if chinese { DISTRESS_QUESTION_ZH } else { DISTRESS_QUESTION };
        sentences.push(question.to_string());
    }
    sentences
}

fn truncate_keeping_question(mut sentences: Vec<String>, max: usize) -> Vec<String> {
    if sentences.len() <= max {
        return sentences;
    }
    match sentences.iter().position(|s| is_question(s)) {
        Some(q) if q >= max => {
            let question = sentences.swap_remove(q);
            sentences.truncate(max - 1);
            sentences.push(question);
        }
        _ => sentences.truncate(max),
    }
    sentences
}

fn join_sentences(sentences: &[String]) -> String {
    let mut out = String::new();
    for sentence in sentences {
        if let Some(prev) = out.chars().last() {
            if !matches!(prev, '。' | '！' | '？') {
                out.push(' ');
            }
        }
        out.push_str(sentence);
    }
    out
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FFEF}')
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| matches!(c, '\u{4E00}'..='\u{9FFF}'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::EmotionAnalysis;
    use crate::persona::PersonaBias;
    use crate::planner::compute_plan;

    fn plan(min: usize, max: usize) -> ReplyPlan {
        let mut plan = compute_plan(&EmotionAnalysis::neutral(), &PersonaBias::default(), None);
        plan.controls.min_sentences = min;
        plan.controls.max_sentences = max;
        plan
    }

    fn distress_plan() -> ReplyPlan {
        let mut plan = plan(2, 5);
        plan.controls.user_distress = true;
        plan
    }

    #[test]
    fn stage_directions_are_removed() {
        let out = enforce("(smiles softly) Hey there. *hugs* How was your day?【温柔】", &plan(2, 4));
        assert_eq!(out, "Hey there. How was your day?");
    }

    #[test]
    fn nested_brackets_strip_completely() {
        assert_eq!(strip_stage_directions("ok (a (b) c) then"), "ok then");
    }

    #[test]
    fn banned_and_filler_sentences_are_dropped() {
        let mut p = plan(1, 6);
        p.controls.banned_phrases.push("Trust the process".to_string());
        let out = enforce(
            "That meeting sounds exhausting. You're not alone in this! Trust the process. What happened after?",
            &p,
        );
        assert_eq!(out, "That meeting sounds exhausting. What happened after?");
    }

    #[test]
    fn safety_mode_softens_directives() {
        let mut p = plan(1, 6);
        p.controls.safety_mode = true;
        let out = enforce("You must call someone tonight. 你必须休息。", &p);
        assert_eq!(out, "You could try to call someone tonight. 你尽量休息。");
    }

    #[test]
    fn distress_drops_self_disclosure_and_keeps_one_question() {
        let out = enforce(
            "I've been through the same thing. Me too, honestly. That sounds so heavy. Did you sleep? Did you eat?",
            &distress_plan(),
        );
        assert_eq!(out, "That sounds so heavy. Did you sleep?");
    }

    #[test]
    fn distress_without_question_gets_acknowledgement_and_question() {
        let out = enforce("Work has been chaotic lately.", &distress_plan());
        assert_eq!(
            out,
            "It sounds like you're carrying a lot right now. Work has been chaotic lately. What feels heaviest for you right now?"
        );
    }

    #[test]
    fn chinese_distress_uses_chinese_prompts_without_spaces() {
        let out = enforce("我也经常这样。工作太多了", &distress_plan());
        assert_eq!(out, "听起来你现在承受了很多。工作太多了。现在最让你难受的是哪一部分？");
    }

    #[test]
    fn truncation_preserves_the_question() {
        let out = enforce("One. Two. Three. Four. Five? Six.", &plan(2, 3));
        assert_eq!(out, "One. Two. Five?");
    }

    #[test]
    fn empty_reply_falls_back_and_pads() {
        let out = enforce("*nods* (quietly)", &plan(2, 4));
        assert_eq!(out, "I'm here, and I'm listening. Take your time.");
    }

    #[test]
    fn padding_goes_before_a_closing_question() {
        assert_eq!(enforce("How are you?", &plan(2, 4)), "Take your time. How are you?");
    }

    #[test]
    fn decimals_and_domains_stay_whole() {
        let p = plan(1, 4);
        assert_eq!(
            enforce("You slept 4.5 hours. How do you feel?", &p),
            "You slept 4.5 hours. How do you feel?"
        );
        assert_eq!(
            split_sentences("Try example.com tonight.It helps! 好的。明天见"),
            vec!["Try example.com tonight.It helps!", "好的。", "明天见。"]
        );
    }

    #[test]
    fn enforce_is_idempotent() {
        let mut safety = plan(2, 4);
        safety.controls.safety_mode = true;
        let cases: Vec<(&str, ReplyPlan)> = vec![
            ("(smiles) Hey. You must rest! *pats* Really? Yes. Five. Six. Seven?", safety),
            ("I get it. me too. nothing else", distress_plan()),
            ("我也难过。你必须早点睡", distress_plan()),
            ("He said \"fine.\" Then left", plan(2, 6)),
            ("", plan(2, 3)),
            ("ok (a (b) c) then?? sure!!", plan(2, 2)),
            ("Version 2.0 shipped.Great news! 好。", plan(1, 4)),
        ];
        for (raw, p) in cases {
            let once = enforce(raw, &p);
            let twice = enforce(&once, &p);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }
}
