//! Bounded sliding-window conversation log

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of turns retained per session
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Who produced a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// A voice-channel user
    User,
    /// The agent
    Assistant,
}

/// A single conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Turn author
    pub role: TurnRole,
    /// Discord user id, when the author is a user
    pub user_id: Option<u64>,
    /// Display name, when known
    pub display_name: Option<String>,
    /// Turn text
    pub content: String,
    /// Monotonic timestamp in milliseconds
    pub timestamp_ms: u64,
}

/// Sliding-window turn log, bounded by `max_turns`
///
/// Append order matches the user/assistant turn order observed by the
/// engine. On overflow the oldest turn is evicted.
#[derive(Debug)]
pub struct ConversationLog {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
    last_timestamp_ms: u64,
}

impl ConversationLog {
    /// Create a log retaining at most `max_turns` turns
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns.min(64)),
            max_turns: max_turns.max(1),
            last_timestamp_ms: 0,
        }
    }

    /// Append a user turn
    pub fn push_user(&mut self, user_id: u64, display_name: Option<String>, content: impl Into<String>) {
        let timestamp_ms = self.next_timestamp();
        self.push(ConversationTurn {
            role: TurnRole::User,
            user_id: Some(user_id),
            display_name,
            content: content.into(),
            timestamp_ms,
        });
    }

    /// Append an assistant turn
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        let timestamp_ms = self.next_timestamp();
        self.push(ConversationTurn {
            role: TurnRole::Assistant,
            user_id: None,
            display_name: None,
            content: content.into(),
            timestamp_ms,
        });
    }

    fn push(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    // Wall clock, clamped so timestamps never go backwards within a log.
    fn next_timestamp(&mut self) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let ts = now_ms.max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms = ts;
        ts
    }

    /// Number of retained turns
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `n` turns in append order
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// All retained turns in append order
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    /// Render retained turns as a plain-text transcript
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| match t.role {
                TurnRole::User => format!(
                    "{}: {}",
                    t.display_name.as_deref().unwrap_or("User"),
                    t.content
                ),
                TurnRole::Assistant => format!("Assistant: {}", t.content),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_order() {
        let mut log = ConversationLog::new(10);
        log.push_user(1, Some("Ada".to_string()), "What time is it?");
        log.push_assistant("It is noon.");

        let turns = log.snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::Assistant);
        assert!(turns[0].timestamp_ms < turns[1].timestamp_ms);
    }

    #[test]
    fn test_window_eviction() {
        let mut log = ConversationLog::new(5);
        for i in 0..12 {
            log.push_user(1, None, format!("turn {}", i));
        }

        assert_eq!(log.len(), 5);
        let turns = log.snapshot();
        // The retained turns are the last max_turns in append order.
        for (idx, turn) in turns.iter().enumerate() {
            assert_eq!(turn.content, format!("turn {}", 7 + idx));
        }
    }

    #[test]
    fn test_recent() {
        let mut log = ConversationLog::new(50);
        for i in 0..20 {
            log.push_user(1, None, format!("turn {}", i));
        }

        let recent = log.recent(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "turn 10");
        assert_eq!(recent[9].content, "turn 19");
    }

    #[test]
    fn test_transcript_rendering() {
        let mut log = ConversationLog::new(10);
        log.push_user(7, Some("Ada".to_string()), "Hello");
        log.push_assistant("Hi there.");

        assert_eq!(log.transcript(), "Ada: Hello\nAssistant: Hi there.");
    }
}
