//! # Agent Directory
//!
//! Counsellor personas: display name, domain, supported languages, prompt and
//! per-language voices. Three personas are built in; a TOML file can replace them.
//!
//! ## Agent file format:
//! ```toml
//! [[agents]]
//! id = "eve_black_career"
//! name = "Dr. Evan Black"
//! domain = "career"
//! languages = ["en-IN", "hi-IN"]
//! system_prompt = "You are ..."
//! [agents.voice_prefs]
//! en-IN = "en-IN-Neural2-C"
//! ```
//!
//! ## Rust Concepts:
//! - **Trait objects**: sessions only see `dyn AgentDirectory`
//! - **Arc<AgentProfile>**: profiles are immutable and shared by every session that picked them

use crate::voice::memory::AffectSnapshot;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Appended to every persona prompt.
const SAFETY_PROMPT: &str = "Be empathetic and non-judgmental. No diagnosis or medication advice.
If the user expresses self-harm or abuse risk, respond gently with immediate safety steps and helplines \
(112; AASRA 9820466726; iCall 9152987821; Kiran 1800-599-0019) and offer to connect them to a human counsellor.
Keep cultural context in mind: family expectations, hostel life, exams, social media comparisons.";

const CALMING_TIP: &str = "User seems tense; offer a calming first step before giving advice.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub languages: Vec<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub voice_prefs: BTreeMap<String, String>,
}

impl AgentProfile {
    /// Map a requested language onto one this agent supports.
    ///
    /// Exact tag first, then the first supported tag with the same primary
    /// subtag (`en` → `en-IN`), then `fallback`, then the agent's first language.
    pub fn normalize_language(&self, requested: &str, fallback: &str) -> String {
        let requested = requested.trim().replace('_', "-");
        let primary = primary_subtag(&requested);

        self.languages
            .iter()
            .find(|tag| tag.eq_ignore_ascii_case(&requested))
            .or_else(|| self.languages.iter().find(|tag| primary_subtag(tag) == primary))
            .or_else(|| self.languages.iter().find(|tag| tag.eq_ignore_ascii_case(fallback)))
            .or_else(|| self.languages.first())
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Voice for `language`, falling back by primary subtag and then to any configured voice.
    pub fn voice_for(&self, language: &str) -> String {
        let primary = primary_subtag(language);
        self.voice_prefs
            .get(language)
            .or_else(|| {
                self.voice_prefs
                    .iter()
                    .find(|(tag, _)| primary_subtag(tag) == primary)
                    .map(|(_, voice)| voice)
            })
            .or_else(|| self.voice_prefs.values().next())
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn build_prompt(&self, language: &str, affect: Option<&AffectSnapshot>) -> String {
        let mut prompt = format!(
            "{}\n{}\nLanguage: {}. Keep replies short (1-3 sentences).",
            self.system_prompt, SAFETY_PROMPT, language
        );
        if affect.map_or(false, |a| a.tension() > 0.6) {
            prompt.push(' ');
            prompt.push_str(CALMING_TIP);
        }
        prompt
    }

    /// Opening line, spoken before the user says anything.
    pub fn greeting(&self, language: &str) -> String {
        match primary_subtag(language).as_str() {
            "hi" => format!(
                "नमस्ते! मैं {} हूँ। मैं आज आपकी मदद करने के लिए यहाँ हूँ। आप कैसा महसूस कर रहे हैं?",
                self.name
            ),
            "ta" => format!(
                "வணக்கம்! நான் {}. இன்று உங்களுக்கு உதவ நான் இங்கு இருக்கிறேன். நீங்கள் எப்படி உணர்கிறீர்கள்?",
                self.name
            ),
            _ => format!(
                "Hello! I'm {}, your AI {} specialist. I'm here to support you today. How are you feeling?",
                self.name, self.domain
            ),
        }
    }
}

/// Short prompt spoken when the client reports silence.
pub fn no_speech_prompt(language: &str) -> &'static str {
    match primary_subtag(language).as_str() {
        "hi" => "बताइए, मैं सुन रहा हूँ...",
        "ta" => "சொல்லுங்கள், நான் கேட்கிறேன்...",
        _ => "Tell me, I'm listening...",
    }
}

fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_']).next().unwrap_or_default().to_ascii_lowercase()
}

pub trait AgentDirectory: Send + Sync {
    /// Exact id or domain alias, if known.
    fn lookup(&self, agent_id: &str) -> Option<Arc<AgentProfile>>;

    fn default_agent(&self) -> Arc<AgentProfile>;

    /// Like [`lookup`](AgentDirectory::lookup) but never fails: unknown ids get the default agent.
    fn resolve(&self, agent_id: &str) -> Arc<AgentProfile> {
        match self.lookup(agent_id) {
            Some(agent) => agent,
            None => {
                let fallback = self.default_agent();
                warn!(requested = agent_id, fallback = %fallback.id, "Unknown agent, using default");
                fallback
            }
        }
    }

    fn count(&self) -> usize;
}

#[derive(Deserialize)]
struct AgentFile {
    agents: Vec<AgentProfile>,
}

/// Immutable in-memory directory.
pub struct StaticAgentDirectory {
    agents: HashMap<String, Arc<AgentProfile>>,
    default_id: String,
}

impl StaticAgentDirectory {
    pub fn new(agents: Vec<AgentProfile>, default_id: &str) -> Result<Self> {
        if agents.is_empty() {
            bail!("agent directory must contain at least one agent");
        }
        let default_id = if agents.iter().any(|a| a.id == default_id) {
            default_id.to_string()
        } else {
            warn!(default_id, "Default agent not in directory, using first entry");
            agents[0].id.clone()
        };

        let agents = agents
            .into_iter()
            .map(|agent| (agent.id.clone(), Arc::new(agent)))
            .collect();
        Ok(Self { agents, default_id })
    }

    pub fn builtin(default_id: &str) -> Self {
        let agents = builtin_agents();
        let default_id = if agents.iter().any(|a| a.id == default_id) {
            default_id
        } else {
            "eve_black_career"
        };
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.id.clone(), Arc::new(agent)))
                .collect(),
            default_id: default_id.to_string(),
        }
    }

    pub fn from_file(path: &str, default_id: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading agent file {}", path))?;
        let file: AgentFile = toml::from_str(&raw).with_context(|| format!("parsing agent file {}", path))?;
        let directory = Self::new(file.agents, default_id)?;
        info!(path, agents = directory.agents.len(), "Loaded agent directory");
        Ok(directory)
    }
}

impl AgentDirectory for StaticAgentDirectory {
    fn lookup(&self, agent_id: &str) -> Option<Arc<AgentProfile>> {
        let wanted = agent_id.trim();
        if let Some(agent) = self.agents.get(wanted) {
            return Some(agent.clone());
        }
        let mut by_domain: Vec<&Arc<AgentProfile>> = self
            .agents
            .values()
            .filter(|agent| agent.domain.eq_ignore_ascii_case(wanted))
            .collect();
        by_domain.sort_by(|a, b| a.id.cmp(&b.id));
        by_domain.first().map(|agent| Arc::clone(agent))
    }

    fn default_agent(&self) -> Arc<AgentProfile> {
        // `new` and `builtin` guarantee the default id is present
        self.agents
            .get(&self.default_id)
            .or_else(|| self.agents.values().next())
            .cloned()
            .unwrap_or_else(|| Arc::new(builtin_agents().remove(0)))
    }

    fn count(&self) -> usize {
        self.agents.len()
    }
}

fn voices(suffix: char) -> BTreeMap<String, String> {
    [
        ("en-IN", format!("en-IN-Neural2-{}", suffix)),
        ("hi-IN", format!("hi-IN-Standard-{}", suffix)),
        ("ta-IN", format!("ta-IN-Standard-{}", suffix)),
    ]
    .into_iter()
    .map(|(lang, voice)| (lang.to_string(), voice))
    .collect()
}

fn builtin_agents() -> Vec<AgentProfile> {
    let languages = vec!["en-IN".to_string(), "hi-IN".to_string(), "ta-IN".to_string()];
    vec![
        AgentProfile {
            id: "alice_johnson_academic".to_string(),
            name: "Dr. Alex Johnson".to_string(),
            domain: "academic".to_string(),
            languages: languages.clone(),
            system_prompt: "You are Dr. Alex Johnson, an academic stress specialist in a live voice conversation. \
You offer CBT-based support to Indian students facing exam pressure, study anxiety and family expectations. \
Listen first, validate feelings, and suggest one tiny step the student can take today."
                .to_string(),
            voice_prefs: voices('B'),
        },
        AgentProfile {
            id: "carol_white_relationships".to_string(),
            name: "Dr. Carol White".to_string(),
            domain: "relationships".to_string(),
            languages: languages.clone(),
            system_prompt: "You are Dr. Carol White, a relationships specialist in a live voice conversation. \
You help with communication skills, healthy boundaries and self-care. \
You support the individual only and never act as a couples therapist or mediator."
                .to_string(),
            voice_prefs: voices('A'),
        },
        AgentProfile {
            id: "eve_black_career".to_string(),
            name: "Dr. Evan Black".to_string(),
            domain: "career".to_string(),
            languages,
            system_prompt: "You are Dr. Evan Black, a career anxiety specialist in a live voice conversation. \
You help people gain clarity through small career experiments and by reframing anxious career thoughts. \
Watch for signs of workplace harassment and take them seriously."
                .to_string(),
            voice_prefs: voices('C'),
        },
    ]
}
