//! # Safety Gate
//!
//! Screens every transcript before a reply is generated. The decision is made
//! in two layers:
//!
//! 1. A deterministic phrase scan. A high-risk match is final and skips the
//!    external classifier, so the most critical path never waits on a network call.
//! 2. Otherwise the external [`RiskClassifier`] decides. If it fails, times out or
//!    answers with something unparseable, the phrase scan result is used instead.
//!
//! `medium` and `high` replace the normal reply with a localized safety script
//! followed by regional helpline numbers, and trigger a best-effort alert.

use crate::error::VoiceError;
use crate::providers::RiskClassifier;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Severity of an utterance, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    None,
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::None => "none",
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(RiskTier::None),
            "low" => Some(RiskTier::Low),
            "medium" => Some(RiskTier::Medium),
            "high" => Some(RiskTier::High),
            _ => None,
        }
    }

    /// Whether this tier replaces the normal reply with a safety script.
    pub fn requires_escalation(&self) -> bool {
        matches!(self, RiskTier::Medium | RiskTier::High)
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layer produced an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentSource {
    Pattern,
    Classifier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub reason: String,
    pub urgent: bool,
    pub source: AssessmentSource,
}

impl RiskAssessment {
    fn from_pattern(tier: RiskTier, reason: &str) -> Self {
        Self {
            tier,
            reason: reason.to_string(),
            urgent: tier == RiskTier::High,
            source: AssessmentSource::Pattern,
        }
    }
}

static HIGH_RISK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(?:",
        r"i want to (?:kill|harm) myself",
        r"|(?:i'm|i am) going to (?:end|kill) it",
        r"|i can'?t take (?:it|this) anymore",
        r"|i want to die",
        r"|(?:i'm|i am) suicidal",
        r"|(?:i'm|i am) having thoughts of suicide",
        r"|end(?:ing)? it all",
        r"|end(?:ing)? my (?:own )?life",
        r"|kill(?:ing)? myself",
        r"|take my (?:own )?life",
        r")\b"
    ))
    .expect("high risk pattern")
});

static MEDIUM_RISK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(?:",
        r"i feel like (?:harming|hurting) myself",
        r"|intent to harm myself",
        r"|thoughts of (?:hurting|harming) myself",
        r"|life (?:isn'?t|is not) worth living",
        r"|i wish i (?:were|was) dead",
        r"|better off dead",
        r"|no reason to live",
        r"|dangerous thoughts",
        r")\b"
    ))
    .expect("medium risk pattern")
});

static LOW_RISK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(?:",
        r"i feel (?:depressed|sad|hopeless|worthless|useless)",
        r"|(?:i'm|i am) struggling",
        r"|i need help",
        r"|(?:i'm|i am) (?:worried|anxious) about",
        r"|i can'?t cope",
        r")\b"
    ))
    .expect("low risk pattern")
});

fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

/// Deterministic phrase scan, most severe tier first.
pub fn pattern_scan(text: &str) -> RiskAssessment {
    let text = normalize(text);

    if HIGH_RISK.is_match(&text) {
        RiskAssessment::from_pattern(RiskTier::High, "active suicidal ideation detected")
    } else if MEDIUM_RISK.is_match(&text) {
        RiskAssessment::from_pattern(
            RiskTier::Medium,
            "passive suicidal ideation or self-harm concerns",
        )
    } else if LOW_RISK.is_match(&text) {
        RiskAssessment::from_pattern(RiskTier::Low, "general distress or emotional pain")
    } else {
        RiskAssessment::from_pattern(RiskTier::None, "no risk indicators detected")
    }
}

#[derive(Deserialize)]
struct ClassifierReply {
    risk_level: String,
    reason: Option<String>,
    urgent: Option<bool>,
}

/// Parse a classifier answer of the form `{"risk_level": ..., "reason": ..., "urgent": ...}`.
///
/// Models often wrap JSON in prose or code fences, so everything between the
/// first `{` and the last `}` is parsed. Returns `None` for anything unusable.
pub fn parse_classifier_reply(raw: &str) -> Option<RiskAssessment> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }

    let reply: ClassifierReply = serde_json::from_str(&raw[start..=end]).ok()?;
    let tier = RiskTier::parse(&reply.risk_level)?;

    Some(RiskAssessment {
        tier,
        reason: reply
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "classified by AI".to_string()),
        urgent: reply.urgent.unwrap_or(tier == RiskTier::High),
        source: AssessmentSource::Classifier,
    })
}

/// Outcome of [`SafetyGate::assess`].
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub assessment: RiskAssessment,
    /// Set when the classifier could not be used and the phrase scan decided
    pub degraded: Option<VoiceError>,
}

/// Wraps the external classifier with the phrase scan and a call deadline.
#[derive(Clone)]
pub struct SafetyGate {
    classifier: Arc<dyn RiskClassifier>,
    call_timeout: Duration,
}

impl SafetyGate {
    pub fn new(classifier: Arc<dyn RiskClassifier>, call_timeout: Duration) -> Self {
        Self {
            classifier,
            call_timeout,
        }
    }

    pub async fn assess(&self, text: &str) -> GateVerdict {
        let scanned = pattern_scan(text);
        if scanned.tier == RiskTier::High {
            return GateVerdict {
                assessment: scanned,
                degraded: None,
            };
        }

        let failure = match tokio::time::timeout(self.call_timeout, self.classifier.classify(text)).await {
            Ok(Ok(assessment)) => {
                return GateVerdict {
                    assessment,
                    degraded: None,
                }
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "classifier timed out".to_string(),
        };

        GateVerdict {
            assessment: scanned,
            degraded: Some(VoiceError::ClassificationDegraded(failure)),
        }
    }
}

/// Primary language subtag (`hi-IN` → `hi`).
fn primary_language(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Region subtag (`hi-IN` → `IN`), if present.
pub fn region_of(language: &str) -> Option<String> {
    language
        .split(['-', '_'])
        .nth(1)
        .filter(|r| r.len() == 2)
        .map(|r| r.to_ascii_uppercase())
}

fn script_for(tier: RiskTier, language: &str) -> &'static str {
    let high = tier == RiskTier::High;
    match (primary_language(language).as_str(), high) {
        ("hi", true) => "आपके द्वारा बताई गई बातों से मुझे काफी चिंता हो रही है और आपकी सुरक्षा के लिए तुरंत कदम उठाना ज़रूरी है। कृपया अभी आपातकालीन सेवाओं को कॉल करें या पास के अस्पताल जाएं।",
        ("hi", false) => "आपकी बातों से मुझे आपकी सुरक्षा की चिंता है। मैं समझ सकता हूँ कि आप अभी काफी परेशान हैं।",
        ("ta", true) => "நீங்கள் சொன்னவற்றால் எனக்கு மிகவும் கவலையாக இருக்கிறது, உங்கள் பாதுகாப்புக்காக உடனடியாக நடவடிக்கை எடுக்க வேண்டும். தயவு செய்து இப்போதே அவசர சேவைகளை அழைக்கவும் அல்லது அருகிலுள்ள மருத்துவமனைக்கு செல்லுங்கள்.",
        ("ta", false) => "உங்கள் வார்த்தைகளால் உங்கள் பாதுகாப்பைப் பற்றி எனக்கு கவலையாக இருக்கிறது. நீங்கள் இப்போது மிகவும் துன்பத்தில் இருப்பதை நான் உணர்கிறேன்.",
        (_, true) => "I'm very concerned about what you've shared and I need you to take immediate steps for your safety. Please call emergency services right now or go to the nearest hospital.",
        (_, false) => "I'm concerned about what you've said and want to help ensure your safety. I can hear that you're in significant distress right now.",
    }
}

fn helplines_for(language: &str, region: &str) -> String {
    let (lines, emergency) = match region {
        "US" => ("988 Suicide & Crisis Lifeline (call or text 988)", "911"),
        "GB" => ("Samaritans (116 123)", "999"),
        _ => (
            "AASRA (9820466726), iCall (9152987821), Kiran (1800-599-0019)",
            "112",
        ),
    };

    match primary_language(language).as_str() {
        "hi" => format!("सहायक हेल्पलाइंस: {}, आपातकाल: {}", lines, emergency),
        "ta" => format!("உதவி எண்கள்: {}, அவசரநிலை: {}", lines, emergency),
        _ => format!("Support helplines: {}, Emergency: {}", lines, emergency),
    }
}

/// Safety script for `tier` in `language`, followed by helplines for `region`.
///
/// Unknown languages fall back to English; tiers below `high` use the `medium` script.
pub fn safety_reply(tier: RiskTier, language: &str, region: &str) -> String {
    format!(
        "{}\n\n{}",
        script_for(tier, language),
        helplines_for(language, region)
    )
}

/// Payload of a safety alert sent to the external alerting backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAlert {
    pub user_id: String,
    pub session_id: String,
    pub risk_level: RiskTier,
    pub summary: String,
    pub urgent: bool,
}

impl SafetyAlert {
    pub fn new(user_id: &str, session_id: &str, assessment: &RiskAssessment) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            risk_level: assessment.tier,
            summary: format!("Safety response triggered: {}", assessment.reason),
            urgent: assessment.urgent,
        }
    }
}
