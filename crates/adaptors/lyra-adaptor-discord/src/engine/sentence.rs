//! Sentence splitter
//!
//! Turns an agent token stream into complete sentences so TTS can start
//! on the first sentence while the model is still generating later ones.

use once_cell::sync::Lazy;
use regex::Regex;

/// Sentence boundary: terminator followed by whitespace
static BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([.!?])\s+").expect("valid regex"));

/// Incremental sentence splitter over streamed tokens
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    /// Create an empty splitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token, returning any sentences it completed
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        loop {
            let Some(found) = BOUNDARY.find(&self.buffer) else {
                break;
            };
            // Keep the terminator, drop the boundary whitespace.
            let terminator_end = found.start() + 1;
            let sentence = self.buffer[..terminator_end].trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            self.buffer.drain(..found.end());
        }
        sentences
    }

    /// Flush the residual buffer as a final sentence, if non-empty
    pub fn flush(&mut self) -> Option<String> {
        let residual = self.buffer.trim().to_string();
        self.buffer.clear();
        if residual.is_empty() {
            None
        } else {
            Some(residual)
        }
    }

    /// Whether any partial sentence is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(tokens: &[&str]) -> Vec<String> {
        let mut splitter = SentenceSplitter::new();
        let mut out = Vec::new();
        for token in tokens {
            out.extend(splitter.push(token));
        }
        out.extend(splitter.flush());
        out
    }

    #[test]
    fn test_whole_string() {
        assert_eq!(
            split_all(&["Hi there. How are you?"]),
            vec!["Hi there.", "How are you?"]
        );
    }

    #[test]
    fn test_token_at_a_time() {
        assert_eq!(
            split_all(&["Hi", " there", ". ", "How ", "are you?"]),
            vec!["Hi there.", "How are you?"]
        );
    }

    #[test]
    fn test_boundary_split_across_tokens() {
        // Terminator and whitespace arrive in different tokens.
        assert_eq!(
            split_all(&["Hi there.", " How are you?"]),
            vec!["Hi there.", "How are you?"]
        );
    }

    #[test]
    fn test_no_terminator_flushes_residual() {
        assert_eq!(split_all(&["no punctuation here"]), vec!["no punctuation here"]);
    }

    #[test]
    fn test_exclamation_and_question() {
        assert_eq!(
            split_all(&["Stop! Really? Yes. "]),
            vec!["Stop!", "Really?", "Yes."]
        );
    }

    #[test]
    fn test_terminator_without_whitespace_waits() {
        let mut splitter = SentenceSplitter::new();
        // "3.14" must not split mid-number.
        assert!(splitter.push("pi is 3.14").is_empty());
        assert_eq!(splitter.push(" exactly. Done"), vec!["pi is 3.14 exactly."]);
        assert_eq!(splitter.flush(), Some("Done".to_string()));
    }

    #[test]
    fn test_empty_flush() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.flush(), None);
        splitter.push("Done. ");
        assert!(splitter.is_empty());
        assert_eq!(splitter.flush(), None);
    }
}
