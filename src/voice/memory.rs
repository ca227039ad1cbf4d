//! Sliding-window conversation memory for one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Emotion scores for the user at a point in time (`happy`, `neutral`, `anxious`, `stressed`, ...).
///
/// Scores are expected in `0.0..=1.0`; missing emotions read as `0.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffectSnapshot(pub BTreeMap<String, f32>);

impl AffectSnapshot {
    pub fn score(&self, emotion: &str) -> f32 {
        self.0.get(emotion).copied().unwrap_or(0.0)
    }

    /// Combined anxious and stressed score.
    pub fn tension(&self) -> f32 {
        self.score("anxious") + self.score("stressed")
    }

    /// One-line hint for the reply generator, or `None` when nothing stands out.
    pub fn guidance(&self) -> Option<&'static str> {
        if self.tension() > 0.6 {
            Some("Emotional context: User appears stressed or anxious - consider offering calming techniques first.")
        } else if self.score("happy") > 0.7 && self.score("neutral") < 0.3 {
            Some("Emotional context: User appears positive and engaged.")
        } else if self.score("stressed") > 0.5 {
            Some("Emotional context: User appears somewhat stressed - pay extra attention to gentle communication.")
        } else {
            None
        }
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
    pub affect: Option<AffectSnapshot>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(user_text: impl Into<String>, assistant_text: impl Into<String>, affect: Option<AffectSnapshot>) -> Self {
        Self {
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            affect,
            timestamp: Utc::now(),
        }
    }
}

/// Fixed-capacity FIFO of turns. The oldest turn is evicted when a new one would exceed `max_turns`.
#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
