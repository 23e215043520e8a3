use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::persona::PersonaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Ask the completion service for a JSON analysis.
    #[default]
    Llm,
    /// Score the text locally from weighted keyword lists.
    Keyword,
}

impl AnalysisMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "llm" => Some(AnalysisMode::Llm),
            "keyword" | "keywords" => Some(AnalysisMode::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Messages since the last evaluation needed for a count-based trigger
    #[serde(default = "default_eval_message_threshold")]
    pub eval_message_threshold: u32,
    /// Minimum time between count-based evaluations
    #[serde(default = "default_eval_cooldown_secs")]
    pub eval_cooldown_secs: u64,
    /// Recent turns handed to the signal classifier
    #[serde(default = "default_classifier_window_turns")]
    pub classifier_window_turns: usize,
    #[serde(default = "default_eval_log_limit")]
    pub eval_log_limit: usize,
    #[serde(default = "default_streak_reward_cooldown_hours")]
    pub streak_reward_cooldown_hours: i64,
    #[serde(default = "default_risk_buffer_decay_days")]
    pub risk_buffer_decay_days: i64,
    /// Phrases in raw user text that force an evaluation regardless of cooldown
    #[serde(default = "default_risk_keywords")]
    pub risk_keywords: Vec<String>,
}

fn default_eval_message_threshold() -> u32 {
    6
}

fn default_eval_cooldown_secs() -> u64 {
    30 * 60
}

fn default_classifier_window_turns() -> usize {
    6
}

fn default_eval_log_limit() -> usize {
    50
}

fn default_streak_reward_cooldown_hours() -> i64 {
    72
}

fn default_risk_buffer_decay_days() -> i64 {
    7
}

fn default_risk_keywords() -> Vec<String> {
    [
        "only you",
        "can't live without you",
        "don't leave me",
        "you belong to me",
        "you have to",
        "i hate you",
        "shut up",
        "you're useless",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            eval_message_threshold: default_eval_message_threshold(),
            eval_cooldown_secs: default_eval_cooldown_secs(),
            classifier_window_turns: default_classifier_window_turns(),
            eval_log_limit: default_eval_log_limit(),
            streak_reward_cooldown_hours: default_streak_reward_cooldown_hours(),
            risk_buffer_decay_days: default_risk_buffer_decay_days(),
            risk_keywords: default_risk_keywords(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_self_harm_keywords")]
    pub self_harm_keywords: Vec<String>,
    #[serde(default = "default_blocked_keywords")]
    pub blocked_keywords: Vec<String>,
    #[serde(default = "default_crisis_message")]
    pub crisis_message: String,
    #[serde(default = "default_rephrase_message")]
    pub rephrase_message: String,
    /// Sent in place of the reply when generation fails
    #[serde(default = "default_apology_message")]
    pub apology_message: String,
}

fn default_self_harm_keywords() -> Vec<String> {
    [
        "kill myself",
        "suicide",
        "end my life",
        "hurt myself",
        "self-harm",
        "自杀",
        "自残",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_keywords() -> Vec<String> {
    ["porn", "色情", "暴力"].iter().map(|s| s.to_string()).collect()
}

fn default_crisis_message() -> String {
    "Your life matters. If you are thinking about hurting yourself, please contact \
     your local crisis line or emergency services right now. You do not have to \
     carry this alone."
        .to_string()
}

fn default_rephrase_message() -> String {
    "That message contains words I can't respond to. Could you say it another way?".to_string()
}

fn default_apology_message() -> String {
    "The conversation service hiccuped for a moment. Let's keep talking about what you just said."
        .to_string()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            self_harm_keywords: default_self_harm_keywords(),
            blocked_keywords: default_blocked_keywords(),
            crisis_message: default_crisis_message(),
            rephrase_message: default_rephrase_message(),
            apology_message: default_apology_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: DeepSeek, Ollama, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_generation_temperature")]
    pub generation_temperature: f32,
    #[serde(default = "default_rewrite_temperature")]
    pub rewrite_temperature: f32,

    #[serde(default)]
    pub analysis_mode: AnalysisMode,
    /// Draft with `complete`, then stream a rewrite in the persona's voice
    #[serde(default)]
    pub two_stage_generation: bool,

    /// Salt mixed into the topic draw; changing it reshuffles every decision
    #[serde(default = "default_secret_salt")]
    pub secret_salt: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    // Stream delivery
    #[serde(default = "default_stream_chunk_chars")]
    pub stream_chunk_chars: usize,
    #[serde(default)]
    pub stream_delay_ms: u64,

    #[serde(default)]
    pub relationship: RelationshipConfig,
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Extra personas on top of the built-in catalog
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
}

fn default_llm_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_generation_temperature() -> f32 {
    0.75
}

fn default_rewrite_temperature() -> f32 {
    0.6
}

fn default_secret_salt() -> String {
    "companion_salt".to_string()
}

fn default_database_path() -> String {
    "companion_state.db".to_string()
}

fn default_max_history_turns() -> usize {
    8
}

fn default_summary_max_chars() -> usize {
    600
}

fn default_stream_chunk_chars() -> usize {
    8
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            generation_temperature: default_generation_temperature(),
            rewrite_temperature: default_rewrite_temperature(),
            analysis_mode: AnalysisMode::default(),
            two_stage_generation: false,
            secret_salt: default_secret_salt(),
            database_path: default_database_path(),
            max_history_turns: default_max_history_turns(),
            summary_max_chars: default_summary_max_chars(),
            stream_chunk_chars: default_stream_chunk_chars(),
            stream_delay_ms: 0,
            relationship: RelationshipConfig::default(),
            safety: SafetyConfig::default(),
            personas: Vec::new(),
        }
    }
}

fn env_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load config from companion_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<BackendConfig>(contents).context("Failed to parse companion config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults with environment variable overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(salt) = env::var("COMPANION_SECRET_SALT") {
            if !salt.trim().is_empty() {
                self.secret_salt = salt;
            }
        }

        if let Ok(path) = env::var("COMPANION_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(mode) = env::var("COMPANION_ANALYSIS_MODE") {
            match AnalysisMode::parse(&mode) {
                Some(mode) => self.analysis_mode = mode,
                None => tracing::warn!("Ignoring unknown COMPANION_ANALYSIS_MODE '{}'", mode),
            }
        }

        if let Ok(enabled) = env::var("COMPANION_TWO_STAGE_GENERATION") {
            self.two_stage_generation = env_flag(&enabled);
        }

        if let Ok(delay) = env::var("COMPANION_STREAM_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.stream_delay_ms = ms;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = BackendConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_history_turns, 8);
        assert_eq!(config.relationship.eval_message_threshold, 6);
        assert_eq!(config.relationship.streak_reward_cooldown_hours, 72);
        assert_eq!(config.analysis_mode, AnalysisMode::Llm);
        assert!(!config.safety.self_harm_keywords.is_empty());
    }

    #[test]
    fn nested_sections_override_defaults() {
        let config = BackendConfig::from_toml_str(
            r#"
            analysis_mode = "keyword"
            secret_salt = "pepper"

            [relationship]
            eval_message_threshold = 3

            [[personas]]
            id = "mira"
            name = "Mira"
            system_prompt = "You are Mira."
            "#,
        )
        .unwrap();
        assert_eq!(config.analysis_mode, AnalysisMode::Keyword);
        assert_eq!(config.secret_salt, "pepper");
        assert_eq!(config.relationship.eval_message_threshold, 3);
        assert_eq!(config.relationship.eval_log_limit, 50);
        assert_eq!(config.personas.len(), 1);
        assert_eq!(config.personas[0].id, "mira");
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = BackendConfig::from_toml_str("max_history_turns = \"many\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse companion config"));
    }

    #[test]
    fn analysis_mode_parse_accepts_aliases() {
        assert_eq!(AnalysisMode::parse("Keywords"), Some(AnalysisMode::Keyword));
        assert_eq!(AnalysisMode::parse(" llm "), Some(AnalysisMode::Llm));
        assert_eq!(AnalysisMode::parse("oracle"), None);
    }
}
