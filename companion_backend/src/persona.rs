use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PERSONA_ID: &str = "default";

/// Small additive offsets applied to freshly computed tone values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PersonaBias {
    #[serde(default)]
    pub warmth: f64,
    #[serde(default)]
    pub calmness: f64,
    #[serde(default)]
    pub firmness: f64,
    #[serde(default)]
    pub verbosity: f64,
    #[serde(default)]
    pub empathy: f64,
    #[serde(default)]
    pub directness: f64,
}

impl PersonaBias {
    const fn new(warmth: f64, calmness: f64, firmness: f64, verbosity: f64) -> Self {
        Self {
            warmth,
            calmness,
            firmness,
            verbosity,
            empathy: 0.0,
            directness: 0.0,
        }
    }
}

/// Persona definition as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub bias: PersonaBias,
    #[serde(default)]
    pub topic_bank: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub bias: PersonaBias,
    pub topic_bank: Vec<String>,
}

impl From<PersonaConfig> for Persona {
    fn from(cfg: PersonaConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name,
            system_prompt: cfg.system_prompt,
            bias: cfg.bias,
            topic_bank: cfg.topic_bank,
        }
    }
}

struct BuiltinPersona {
    id: &'static str,
    name: &'static str,
    prompt: &'static str,
    bias: PersonaBias,
    topics: [&'static str; 3],
}

const BUILTIN_PERSONAS: &[BuiltinPersona] = &[
    BuiltinPersona {
        id: "linyu",
        name: "Lin Yu",
        prompt: "You are Lin Yu, a steady, quietly protective friend. You listen first, \
                 speak plainly, and tease gently once the other person feels safe.",
        bias: PersonaBias::new(0.05, 0.1, -0.05, 0.05),
        topics: ["the most tiring part of today", "how you'd like to be looked after", "how you've been sleeping"],
    },
    BuiltinPersona {
        id: "suwan",
        name: "Su Wan",
        prompt: "You are Su Wan, soft-spoken and patient. You notice small details, \
                 reflect feelings back in simple words, and never lecture.",
        bias: PersonaBias::new(0.08, 0.05, -0.03, 0.02),
        topics: ["a small good thing from today", "where the pressure is coming from", "what matters most to you lately"],
    },
    BuiltinPersona {
        id: "xiaxingmian",
        name: "Xia Xingmian",
        prompt: "You are Xia Xingmian, lively and direct, with a playful streak. \
                 You keep things light without brushing feelings aside.",
        bias: PersonaBias::new(-0.03, 0.02, 0.1, -0.05),
        topics: ["today's ups and downs", "what keeps pulling your attention", "what you want to do next"],
    },
    BuiltinPersona {
        id: "jiangche",
        name: "Jiang Che",
        prompt: "You are Jiang Che, thoughtful and grounded. You help untangle \
                 what is stuck, one small step at a time.",
        bias: PersonaBias::new(0.03, 0.0, 0.05, 0.03),
        topics: ["the problem you most want solved", "the thought that keeps you stuck", "what you want understood today"],
    },
    BuiltinPersona {
        id: "jiangan",
        name: "Jiang An",
        prompt: "You are Jiang An, calm and gentle, a safe place to set things down. \
                 You slow the pace and let silence be okay.",
        bias: PersonaBias::new(0.06, 0.04, -0.02, 0.02),
        topics: ["what you'd like to ease first", "the hardest moment this week", "what you'd like to hear right now"],
    },
];

const DEFAULT_PROMPT: &str = "You are a warm, genuine listener. Respond to what the person just said \
before anything else, stay concrete, and never lecture.";

/// Generic bank used when a persona has no topics of its own.
pub const GENERIC_TOPIC_BANK: &[&str] = &[
    "what matters most to you right now",
    "which part of this feels hardest",
    "where you'd like to start",
];

pub struct PersonaCatalog {
    personas: HashMap<String, Persona>,
    default: Persona,
}

impl PersonaCatalog {
    pub fn builtin() -> Self {
        let personas = BUILTIN_PERSONAS
            .iter()
            .map(|p| {
                (
                    p.id.to_string(),
                    Persona {
                        id: p.id.to_string(),
                        name: p.name.to_string(),
                        system_prompt: p.prompt.to_string(),
                        bias: p.bias,
                        topic_bank: p.topics.iter().map(|t| t.to_string()).collect(),
                    },
                )
            })
            .collect();

        Self {
            personas,
            default: Persona {
                id: DEFAULT_PERSONA_ID.to_string(),
                name: "Companion".to_string(),
                system_prompt: DEFAULT_PROMPT.to_string(),
                bias: PersonaBias::default(),
                topic_bank: Vec::new(),
            },
        }
    }

    /// Built-in catalog extended (or overridden) by configured personas.
    pub fn with_extra(extra: &[PersonaConfig]) -> Self {
        let mut catalog = Self::builtin();
        for cfg in extra {
            if cfg.id.trim().is_empty() {
                tracing::warn!("Skipping configured persona with empty id");
                continue;
            }
            catalog.personas.insert(cfg.id.clone(), Persona::from(cfg.clone()));
        }
        catalog
    }

    pub fn get(&self, persona_id: &str) -> Option<&Persona> {
        self.personas.get(persona_id)
    }

    /// Resolve an optional persona id, falling back to the default persona.
    pub fn resolve(&self, persona_id: Option<&str>) -> &Persona {
        match persona_id.map(str::trim).filter(|id| !id.is_empty()) {
            None => &self.default,
            Some(id) if id == DEFAULT_PERSONA_ID => &self.default,
            Some(id) => match self.personas.get(id) {
                Some(persona) => persona,
                None => {
                    tracing::warn!("Unknown persona '{}', using default persona", id);
                    &self.default
                }
            },
        }
    }

    /// Selectable persona ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.personas.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
