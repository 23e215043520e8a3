//! Turn orchestration.
//!
//! A turn runs in two critical sections on its conversation key. The first
//! allocates the round, analyzes the message and persists a pending turn; the
//! second writes the delivered text back into that turn by round id.
//! Generation and delivery happen between them with no lock held. The
//! relationship step runs last under its own per-pair key.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::analysis::EmotionAnalyzer;
use crate::config::BackendConfig;
use crate::conversation::{make_conv_key, ConversationState, ConversationStateStore, TurnRecord};
use crate::guard;
use crate::llm_client::{CompletionService, Message};
use crate::locks::ConversationLockRegistry;
use crate::persona::{Persona, PersonaCatalog};
use crate::planner::{compute_plan, ReplyPlan};
use crate::prompt::{build_generation_messages, build_rewrite_messages};
use crate::relationship::{
    check_trigger, relationship_key, AffinityJudge, EvalLogEntry, RelationshipState,
    RelationshipStateStore, SignalClassifier,
};
use crate::safety::{is_distress, screen_input, InputVerdict};
use crate::store::DocumentStore;
use crate::topic::TopicInjectionPolicy;

/// Temperature for the draft in two-stage generation
const DRAFT_TEMPERATURE: f32 = 0.7;

pub const ANALYSIS_FALLBACK_MARKER: &str = "analysis_fallback";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub device_id: String,
    pub persona_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conv_key: String,
    /// None when input screening answered the turn
    pub round_id: Option<u64>,
    pub verdict: InputVerdict,
    pub reply: String,
    pub error: Option<String>,
    pub evaluation: Option<EvalLogEntry>,
}

/// Reply chunks as they are delivered, plus the turn's final outcome.
pub struct TurnStream {
    pub chunks: flume::Receiver<String>,
    pub done: JoinHandle<TurnOutcome>,
}

impl TurnStream {
    /// Drain the stream and wait for the turn to finish.
    pub async fn into_text(self) -> Result<(String, TurnOutcome)> {
        let mut text = String::new();
        while let Ok(chunk) = self.chunks.recv_async().await {
            text.push_str(&chunk);
        }
        let outcome = self.done.await.context("Turn task failed")?;
        Ok((text, outcome))
    }
}

struct PreparedTurn {
    round_id: u64,
    plan: ReplyPlan,
    messages: Vec<Message>,
}

pub struct TurnPipeline {
    config: BackendConfig,
    completion: Arc<dyn CompletionService>,
    analyzer: EmotionAnalyzer,
    classifier: Arc<dyn SignalClassifier>,
    personas: PersonaCatalog,
    topics: TopicInjectionPolicy,
    judge: AffinityJudge,
    conversations: ConversationStateStore,
    relationships: RelationshipStateStore,
    locks: ConversationLockRegistry,
    relationship_locks: ConversationLockRegistry,
}

impl TurnPipeline {
    pub fn new(
        config: BackendConfig,
        completion: Arc<dyn CompletionService>,
        classifier: Arc<dyn SignalClassifier>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            analyzer: EmotionAnalyzer::new(completion.clone(), config.analysis_mode),
            personas: PersonaCatalog::with_extra(&config.personas),
            topics: TopicInjectionPolicy::new(config.secret_salt.clone()),
            judge: AffinityJudge::new(&config.relationship),
            conversations: ConversationStateStore::new(store.clone()),
            relationships: RelationshipStateStore::new(store),
            locks: ConversationLockRegistry::new(),
            relationship_locks: ConversationLockRegistry::new(),
            completion,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    pub fn conversation_state(&self, conv_key: &str) -> ConversationState {
        self.conversations.load(conv_key)
    }

    pub fn relationship_state(&self, user_id: &str, persona_id: &str) -> RelationshipState {
        self.relationships.load(user_id, persona_id)
    }

    /// Start a turn. Chunks arrive on the returned stream; the join handle
    /// resolves once the turn and its relationship step are persisted.
    pub fn handle_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (tx, rx) = flume::unbounded();
        let pipeline = Arc::clone(self);
        let done = tokio::spawn(async move { pipeline.run_turn(request, tx).await });
        TurnStream { chunks: rx, done }
    }

    async fn run_turn(&self, request: TurnRequest, tx: flume::Sender<String>) -> TurnOutcome {
        let persona = self.personas.resolve(request.persona_id.as_deref());
        let conv_key = make_conv_key(&request.user_id, &request.device_id, Some(&persona.id));

        let verdict = screen_input(&request.text, &self.config.safety);
        if let Some(reply) = verdict.fixed_reply() {
            let reply = reply.to_string();
            tracing::info!("Turn on {} answered by input screening", conv_key);
            self.deliver(&tx, &reply).await;
            return TurnOutcome {
                conv_key,
                round_id: None,
                verdict,
                reply,
                error: None,
                evaluation: None,
            };
        }

        let prepared = self.prepare_turn(&conv_key, persona, &request.text).await;
        let round_id = prepared.round_id;
        tracing::info!("Turn {} round {} planned", conv_key, round_id);

        let (reply, error) = match self.generate(persona, &prepared.plan, prepared.messages).await {
            Ok(raw) => (guard::enforce(&raw, &prepared.plan), None),
            Err(e) => {
                tracing::warn!("Generation failed for {} round {}: {:#}", conv_key, round_id, e);
                (
                    self.config.safety.apology_message.clone(),
                    Some(format!("generation_failed: {:#}", e)),
                )
            }
        };

        self.deliver(&tx, &reply).await;
        drop(tx);

        let window = self.finish_turn(&conv_key, round_id, &reply, error.clone()).await;
        let evaluation = self
            .update_relationship(&request.user_id, persona, &request.text, &window)
            .await;

        TurnOutcome {
            conv_key,
            round_id: Some(round_id),
            verdict,
            reply,
            error,
            evaluation,
        }
    }

    /// Drop per-key locks that no in-flight turn holds.
    pub fn prune_locks(&self) -> usize {
        let pruned = self.locks.prune_idle() + self.relationship_locks.prune_idle();
        if pruned > 0 {
            tracing::debug!("Pruned {} idle conversation lock(s)", pruned);
        }
        pruned
    }

    /// First critical section: allocate the round, analyze, plan and persist
    /// the pending turn.
    async fn prepare_turn(&self, conv_key: &str, persona: &Persona, user_text: &str) -> PreparedTurn {
        let _guard = self.locks.acquire(conv_key).await;

        let mut state = self.conversations.load(conv_key);
        let round_id = state.next_round_id();

        let analysis = self.analyzer.analyze(&state.history_text(), user_text).await;
        let distress = is_distress(user_text);

        let mut plan = compute_plan(&analysis, &persona.bias, state.last_plan.as_ref());
        plan.controls.user_distress = distress;
        plan.controls.topic = self
            .topics
            .decide(conv_key, round_id, &analysis, persona, user_text, distress);
        if plan.controls.topic.inject {
            plan.controls.ask_question = true;
        }
        tracing::debug!(
            "Plan for {} round {}: safety_mode={} distress={} topic_inject={} seed='{}'",
            conv_key,
            round_id,
            plan.controls.safety_mode,
            distress,
            plan.controls.topic.inject,
            plan.controls.topic.seed
        );

        let messages = build_generation_messages(persona, &plan, &state, user_text);

        let mut turn = TurnRecord::pending(round_id, user_text, analysis, plan.clone());
        if turn.analysis.degraded {
            turn.error = Some(ANALYSIS_FALLBACK_MARKER.to_string());
        }
        state.turns.push(turn);
        state.last_plan = Some(plan.clone());

        if let Err(e) = self.conversations.save(&state) {
            tracing::error!("Failed to persist pending turn {} round {}: {:#}", conv_key, round_id, e);
        }

        PreparedTurn {
            round_id,
            plan,
            messages,
        }
    }

    async fn generate(&self, persona: &Persona, plan: &ReplyPlan, messages: Vec<Message>) -> Result<String> {
        if !self.config.two_stage_generation {
            return self
                .collect_stream(messages, self.config.generation_temperature)
                .await;
        }

        let draft = self
            .completion
            .complete(messages, DRAFT_TEMPERATURE)
            .await
            .context("Draft generation failed")?;
        self.collect_stream(
            build_rewrite_messages(persona, plan, &draft),
            self.config.rewrite_temperature,
        )
        .await
        .context("Voice rewrite failed")
    }

    async fn collect_stream(&self, messages: Vec<Message>, temperature: f32) -> Result<String> {
        let mut stream = self.completion.stream(messages, temperature).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    async fn deliver(&self, tx: &flume::Sender<String>, reply: &str) {
        for chunk in chunk_text(reply, self.config.stream_chunk_chars) {
            if tx.send_async(chunk).await.is_err() {
                tracing::debug!("Stream consumer disconnected; persisting without delivery");
                return;
            }
            if self.config.stream_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.stream_delay_ms)).await;
            }
        }
    }

    /// Second critical section: write the delivered text by round id and fold
    /// history. Returns the classifier window.
    async fn finish_turn(
        &self,
        conv_key: &str,
        round_id: u64,
        reply: &str,
        error: Option<String>,
    ) -> Vec<Message> {
        let _guard = self.locks.acquire(conv_key).await;

        let mut state = self.conversations.load(conv_key);
        if !state.complete_turn(round_id, reply, error, Utc::now()) {
            // A state without this round is not the one prepare_turn saved.
            tracing::warn!("Turn {} round {} no longer in history; reply not recorded", conv_key, round_id);
            return recent_window(&state, self.config.relationship.classifier_window_turns);
        }
        state.fold_history(self.config.max_history_turns, self.config.summary_max_chars);

        if let Err(e) = self.conversations.save(&state) {
            tracing::error!("Failed to persist reply for {} round {}: {:#}", conv_key, round_id, e);
        }

        recent_window(&state, self.config.relationship.classifier_window_turns)
    }

    async fn update_relationship(
        &self,
        user_id: &str,
        persona: &Persona,
        user_text: &str,
        window: &[Message],
    ) -> Option<EvalLogEntry> {
        let _guard = self
            .relationship_locks
            .acquire(&relationship_key(user_id, &persona.id))
            .await;

        let mut state = self.relationships.load(user_id, &persona.id);
        state.messages_since_eval += 1;
        let now = Utc::now();

        let evaluation = match check_trigger(&state, user_text, &self.config.relationship, now) {
            None => None,
            Some(trigger) => {
                let classification = self.classifier.classify(&persona.id, &persona.name, window).await;
                let outcome = self
                    .judge
                    .evaluate(&mut state, &classification.signals, classification.confidence, now);
                let score_after = state.apply(outcome.delta);
                let entry = EvalLogEntry {
                    at: now,
                    signals: classification.signals,
                    confidence: classification.confidence,
                    delta: outcome.delta,
                    score_after,
                    note: outcome.note,
                    trigger,
                };
                tracing::info!(
                    "Relationship {}:{} evaluated ({:?}): {:+.2} -> {:.2}",
                    user_id,
                    persona.id,
                    trigger,
                    entry.delta,
                    score_after
                );
                state.record_evaluation(entry.clone(), self.config.relationship.eval_log_limit);
                Some(entry)
            }
        };

        if let Err(e) = self.relationships.save(&state) {
            tracing::error!("Failed to persist relationship {}:{}: {:#}", user_id, persona.id, e);
        }
        evaluation
    }
}

/// The last `turns` completed exchanges as chat messages.
fn recent_window(state: &ConversationState, turns: usize) -> Vec<Message> {
    let completed: Vec<&TurnRecord> = state.completed_turns().collect();
    let start = completed.len().saturating_sub(turns);
    completed[start..]
        .iter()
        .flat_map(|turn| {
            let mut pair = vec![Message::user(turn.user_text.clone())];
            if let Some(reply) = &turn.assistant_text {
                pair.push(Message::assistant(reply.clone()));
            }
            pair
        })
        .collect()
}

fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}
