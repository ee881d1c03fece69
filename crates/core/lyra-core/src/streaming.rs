//! Agent reply streaming
//!
//! The host runtime delivers a reply as buffered text blocks over a
//! channel. The voice plane reads them incrementally so TTS can start
//! on the first sentence while the rest is still being generated, and
//! needs the complete reply afterwards for the conversation log.
//! [`ReplyReader`] serves both at once: it hands blocks out as they
//! arrive and keeps the accumulated reply.

use crate::Result;
use tokio::sync::mpsc;

/// One delivered block of agent reply text
#[derive(Debug, Clone)]
pub struct TextChunk {
    /// Block text
    pub text: String,
    /// Whether this is the last block of the reply
    pub is_final: bool,
}

/// Stream of reply blocks
pub type TextStream = mpsc::Receiver<Result<TextChunk>>;

/// Stream sender
pub type TextStreamSender = mpsc::Sender<Result<TextChunk>>;

/// Create a new reply stream
pub fn create_text_stream(buffer_size: usize) -> (TextStreamSender, TextStream) {
    mpsc::channel(buffer_size)
}

/// Incremental reader over a reply stream
///
/// Terminates on the final block, on stream close, or on the first
/// error; whatever text was delivered up to that point is retained, so
/// a barge-in mid-reply still leaves a usable partial turn.
pub struct ReplyReader {
    stream: TextStream,
    reply: String,
    done: bool,
}

impl ReplyReader {
    /// Wrap a dispatched reply stream
    pub fn new(stream: TextStream) -> Self {
        Self {
            stream,
            reply: String::new(),
            done: false,
        }
    }

    /// The next delivered block, accumulated into the reply
    ///
    /// Returns `None` once the reply is complete. An error ends the
    /// reply; later calls return `None`.
    pub async fn next_block(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        match self.stream.recv().await {
            Some(Ok(chunk)) => {
                self.reply.push_str(&chunk.text);
                if chunk.is_final {
                    self.done = true;
                }
                Some(Ok(chunk.text))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Everything delivered so far
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Whether the reply has ended
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume the reader, keeping the accumulated reply
    pub fn into_reply(self) -> String {
        self.reply
    }
}

/// Read a reply stream to completion and return the whole text
pub async fn drain_reply(stream: TextStream) -> Result<String> {
    let mut reader = ReplyReader::new(stream);
    while let Some(block) = reader.next_block().await {
        block?;
    }
    Ok(reader.into_reply())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LyraError;

    async fn send_blocks(tx: TextStreamSender, blocks: Vec<(&str, bool)>) {
        for (text, is_final) in blocks {
            let _ = tx
                .send(Ok(TextChunk {
                    text: text.to_string(),
                    is_final,
                }))
                .await;
        }
    }

    #[tokio::test]
    async fn test_blocks_accumulate() {
        let (tx, rx) = create_text_stream(8);
        tokio::spawn(send_blocks(
            tx,
            vec![("It is noon. ", false), ("Let me know if you need more.", true)],
        ));

        let mut reader = ReplyReader::new(rx);
        assert_eq!(
            reader.next_block().await.unwrap().unwrap(),
            "It is noon. "
        );
        assert_eq!(reader.reply(), "It is noon. ");
        assert!(!reader.is_done());

        assert!(reader.next_block().await.unwrap().is_ok());
        assert!(reader.is_done());
        assert!(reader.next_block().await.is_none());
        assert_eq!(
            reader.into_reply(),
            "It is noon. Let me know if you need more."
        );
    }

    #[tokio::test]
    async fn test_closed_stream_keeps_partial_reply() {
        let (tx, rx) = create_text_stream(8);
        let mut reader = ReplyReader::new(rx);

        tx.send(Ok(TextChunk {
            text: "partial".to_string(),
            is_final: false,
        }))
        .await
        .unwrap();
        drop(tx);

        assert!(reader.next_block().await.unwrap().is_ok());
        assert!(reader.next_block().await.is_none());
        assert_eq!(reader.reply(), "partial");
    }

    #[tokio::test]
    async fn test_error_ends_reply() {
        let (tx, rx) = create_text_stream(8);
        let mut reader = ReplyReader::new(rx);

        tx.send(Ok(TextChunk {
            text: "before ".to_string(),
            is_final: false,
        }))
        .await
        .unwrap();
        tx.send(Err(LyraError::other("model died"))).await.unwrap();

        assert!(reader.next_block().await.unwrap().is_ok());
        assert!(reader.next_block().await.unwrap().is_err());
        assert!(reader.next_block().await.is_none());
        assert_eq!(reader.reply(), "before ");
    }

    #[tokio::test]
    async fn test_drain_reply() {
        let (tx, rx) = create_text_stream(8);
        tokio::spawn(send_blocks(tx, vec![("Hello ", false), ("there.", true)]));
        assert_eq!(drain_reply(rx).await.unwrap(), "Hello there.");
    }

    #[tokio::test]
    async fn test_drain_reply_propagates_errors() {
        let (tx, rx) = create_text_stream(8);
        tx.send(Err(LyraError::other("boom"))).await.unwrap();
        assert!(drain_reply(rx).await.is_err());
    }
}
