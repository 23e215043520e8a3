//! Message assembly for reply generation.

use std::fmt::Write as _;

use crate::conversation::ConversationState;
use crate::llm_client::Message;
use crate::persona::Persona;
use crate::planner::ReplyPlan;

const REPLY_RULES: &str = "Respond to what the user just said before anything else. \
No bracketed actions or stage directions. Avoid stock comfort phrases. \
If you raise a new topic, do it only as one light question in the final sentence.";

const REWRITE_RULES: &str = "Rewrite the draft below in your own voice. Keep its meaning. \
No bracketed actions. At most one question. No abrupt topic switches. \
Output only the rewritten reply.";

/// Render the plan as the `[REPLY_CONTROL]` system block.
pub fn render_control_block(plan: &ReplyPlan) -> String {
    let tone = &plan.tone;
    let controls = &plan.controls;
    let mut block = String::from("[REPLY_CONTROL]\n");

    // Writing to a String cannot fail.
    let _ = writeln!(block, "warmth={:.2}", tone.warmth);
    let _ = writeln!(block, "calmness={:.2}", tone.calmness);
    let _ = writeln!(block, "firmness={:.2}", tone.firmness);
    let _ = writeln!(block, "verbosity={:.2}", tone.verbosity);
    let _ = writeln!(block, "empathy={:.2}", tone.empathy);
    let _ = writeln!(block, "directness={:.2}", tone.directness);
    let _ = writeln!(block, "safety_mode={}", controls.safety_mode);
    let _ = writeln!(block, "style_flags={}", controls.style_flags.join(","));
    let _ = writeln!(block, "ban_phrases={}", controls.banned_phrases.join(","));
    let _ = writeln!(
        block,
        "sentences={}-{}",
        controls.min_sentences, controls.max_sentences
    );
    let _ = writeln!(block, "ask_question={}", controls.ask_question);
    let _ = writeln!(block, "user_distress={}", controls.user_distress);
    let _ = writeln!(block, "topic_injection={}", controls.topic.inject);
    let _ = writeln!(block, "topic_seed={}", controls.topic.seed);
    block.push_str(
        "rule_if_topic_injection=true: end with one natural follow-up question related to \
         topic_seed or the current topic; never use a hard transition such as \"by the way\" or \"anyway\".",
    );
    block
}

/// Persona prompt, control block, rolling summary, completed turns, then the input.
pub fn build_generation_messages(
    persona: &Persona,
    plan: &ReplyPlan,
    state: &ConversationState,
    user_text: &str,
) -> Vec<Message> {
    let mut messages = vec![
        Message::system(persona.system_prompt.clone()),
        Message::system(REPLY_RULES),
        Message::system(render_control_block(plan)),
    ];

    if !state.summary.is_empty() {
        messages.push(Message::system(format!("Earlier in this conversation:\n{}", state.summary)));
    }

    for turn in state.completed_turns() {
        messages.push(Message::user(turn.user_text.clone()));
        if let Some(reply) = &turn.assistant_text {
            messages.push(Message::assistant(reply.clone()));
        }
    }

    messages.push(Message::user(user_text));
    messages
}

/// Second stage of two-stage generation: restate a draft in the persona's voice.
pub fn build_rewrite_messages(persona: &Persona, plan: &ReplyPlan, draft: &str) -> Vec<Message> {
    vec![
        Message::system(persona.system_prompt.clone()),
        Message::system(REWRITE_RULES),
        Message::system(render_control_block(plan)),
        Message::user(draft),
    ]
}
