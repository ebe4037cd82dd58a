//! Server-sent-event decoding for the chat backend.
//!
//! The backend re-sends its cumulative answer in every `data:` frame, so the
//! decoder keeps only the latest extracted value instead of concatenating.

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use labeler_core::{Error, Result};

/// Pulls the answer text out of one parsed `data:` payload.
pub type Extractor = fn(&Value) -> Option<String>;

/// One decoded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event_name: Option<String>,
    pub payload: String,
}

impl StreamFrame {
    pub fn is_done(&self) -> bool {
        self.payload == "[DONE]"
    }
}

/// Line-buffered SSE decoder with a last-write-wins accumulator.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    latest: Option<String>,
    extract: Extractor,
}

impl StreamDecoder {
    /// Upper bound on buffered, not yet line-terminated text.
    const MAX_BUFFER_SIZE: usize = 1024 * 1024;

    pub fn new(extract: Extractor) -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            latest: None,
            extract,
        }
    }

    /// Append a chunk and return the frames completed by it.
    ///
    /// Bytes are buffered undecoded until a newline arrives, so a multi-byte
    /// character split across chunks survives intact. The size cap applies
    /// only to the unterminated fragment left after complete lines are taken.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + rel;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        self.buffer.drain(..start);

        if self.buffer.len() > Self::MAX_BUFFER_SIZE {
            tracing::warn!(
                target: "labeler::stream",
                limit_kb = Self::MAX_BUFFER_SIZE / 1024,
                "unterminated line over limit, dropping oldest half"
            );
            let keep_from = self.buffer.len() - Self::MAX_BUFFER_SIZE / 2;
            self.buffer.drain(..keep_from);
        }

        frames
    }

    pub fn push_str(&mut self, s: &str) -> Vec<StreamFrame> {
        self.push(s.as_bytes())
    }

    fn process_line(&mut self, line: &str) -> Option<StreamFrame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            // blank line closes the current event
            self.event = None;
            return None;
        }
        if let Some(name) = field(line, "event") {
            self.event = Some(name.to_string());
            return None;
        }
        let payload = field(line, "data")?;
        Some(StreamFrame {
            event_name: self.event.clone(),
            payload: payload.to_string(),
        })
    }

    /// Fold one frame into the accumulator.
    pub fn reduce(&mut self, frame: &StreamFrame) {
        if frame.is_done() {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
            tracing::trace!(target: "labeler::stream", "skipping unparseable data line");
            return;
        };
        if let Some(text) = (self.extract)(&value) {
            self.latest = Some(text);
        }
    }

    /// Push a chunk and fold every completed frame.
    pub fn feed(&mut self, chunk: &[u8]) {
        for frame in self.push(chunk) {
            self.reduce(&frame);
        }
    }

    /// Finish decoding. An unterminated trailing line is processed first.
    pub fn finish(mut self) -> Result<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(frame) = self.process_line(&rest) {
                self.reduce(&frame);
            }
        }
        self.latest.ok_or(Error::EmptyStream)
    }

    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }
}

/// `"data: x"` / `"data:x"` → `"x"` for the given field name.
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Drain a chunked byte stream through a decoder and return the final text.
pub async fn decode_stream<S, B, E>(stream: S, extract: Extractor) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new(extract);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Transport {
            status: None,
            message: format!("stream interrupted: {e}"),
        })?;
        decoder.feed(chunk.as_ref());
    }
    decoder.finish()
}

/// Chat backend frames: `{"message": {"content": {"parts": [..., "<text>"]}}}`.
pub fn conversation_text(value: &Value) -> Option<String> {
    value
        .pointer("/message/content/parts")?
        .as_array()?
        .iter()
        .rev()
        .find_map(|p| p.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"message": {"content": {"parts": [text]}}})
        )
    }

    fn decode_all(chunks: &[&str]) -> Result<String> {
        let mut decoder = StreamDecoder::new(conversation_text);
        for chunk in chunks {
            decoder.feed(chunk.as_bytes());
        }
        decoder.finish()
    }

    #[test]
    fn test_last_value_wins() {
        let body = format!("{}{}{}data: [DONE]\n\n", frame("[\"Ne"), frame("[\"News\""), frame("[\"News\"]"));
        assert_eq!(decode_all(&[&body]).unwrap(), "[\"News\"]");
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let body = format!("{}{}data: [DONE]\n\n", frame("partial"), frame("complete answer"));
        let whole = decode_all(&[&body]).unwrap();

        for split in 1..body.len() {
            let (a, b) = body.split_at(split);
            assert_eq!(decode_all(&[a, b]).unwrap(), whole, "split at {split}");
        }
    }

    #[test]
    fn test_large_body_same_result_whole_or_chunked() {
        let mut body = frame("ANSWER");
        let padding = format!(
            "data: {}\n\n",
            serde_json::json!({"type": "moderation", "note": "x".repeat(200)})
        );
        while body.len() < 1_300_000 {
            body.push_str(&padding);
        }
        body.push_str("data: [DONE]\n\n");
        assert!(body.len() > StreamDecoder::MAX_BUFFER_SIZE);

        let mut whole = StreamDecoder::new(conversation_text);
        whole.feed(body.as_bytes());

        let mut chunked = StreamDecoder::new(conversation_text);
        for chunk in body.as_bytes().chunks(8192) {
            chunked.feed(chunk);
        }

        assert_eq!(chunked.latest(), Some("ANSWER"));
        assert_eq!(whole.latest(), chunked.latest());
        assert_eq!(whole.finish().unwrap(), "ANSWER");
    }

    #[test]
    fn test_oversized_unterminated_line_is_capped() {
        let mut decoder = StreamDecoder::new(conversation_text);
        let frames = decoder.push(&vec![b'x'; StreamDecoder::MAX_BUFFER_SIZE + 10]);
        assert!(frames.is_empty());
        assert!(decoder.buffer.len() <= StreamDecoder::MAX_BUFFER_SIZE / 2);
    }

    #[test]
    fn test_split_multibyte_char_across_chunks() {
        let body = frame("Überwachung");
        let bytes = body.as_bytes();
        let pos = body.find('Ü').unwrap() + 1; // inside the two-byte sequence
        let mut decoder = StreamDecoder::new(conversation_text);
        decoder.feed(&bytes[..pos]);
        decoder.feed(&bytes[pos..]);
        assert_eq!(decoder.finish().unwrap(), "Überwachung");
    }

    #[test]
    fn test_unparseable_line_is_skipped() {
        let body = format!("{}data: {{\"message\": {{\"cont\n{}", frame("first"), "data: not-json\n\n");
        assert_eq!(decode_all(&[&body]).unwrap(), "first");
    }

    #[test]
    fn test_empty_stream_error() {
        assert!(matches!(decode_all(&["data: [DONE]\n\n"]), Err(Error::EmptyStream)));
        assert!(matches!(decode_all(&[]), Err(Error::EmptyStream)));
        // frames without the text field never capture anything
        assert!(matches!(
            decode_all(&["data: {\"message\": null}\n\n"]),
            Err(Error::EmptyStream)
        ));
    }

    #[test]
    fn test_event_names_attach_to_following_data() {
        let mut decoder = StreamDecoder::new(conversation_text);
        let frames = decoder.push_str("event: delta\r\ndata: {}\r\n\r\ndata: {}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event_name.as_deref(), Some("delta"));
        assert_eq!(frames[0].payload, "{}");
        assert_eq!(frames[1].event_name, None);
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut decoder = StreamDecoder::new(conversation_text);
        let frames = decoder.push_str(": keep-alive\nid: 7\nretry: 100\ndata:tight\n");
        assert_eq!(frames, vec![StreamFrame { event_name: None, payload: "tight".into() }]);
    }

    #[test]
    fn test_unterminated_trailing_line_is_processed() {
        let body = frame("tail");
        let trimmed = body.trim_end();
        assert_eq!(decode_all(&[trimmed]).unwrap(), "tail");
    }

    #[test]
    fn test_conversation_text_takes_last_string_part() {
        let value = serde_json::json!({"message": {"content": {"parts": ["a", "b"]}}});
        assert_eq!(conversation_text(&value).as_deref(), Some("b"));
        let value = serde_json::json!({"message": {"content": {"parts": []}}});
        assert_eq!(conversation_text(&value), None);
    }

    #[tokio::test]
    async fn test_decode_stream_from_chunks() {
        let body = format!("{}{}data: [DONE]\n\n", frame("one"), frame("two"));
        let (a, b) = body.split_at(17);
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(a.as_bytes().to_vec()), Ok(b.as_bytes().to_vec())];
        let text = decode_stream(futures_util::stream::iter(chunks), conversation_text)
            .await
            .unwrap();
        assert_eq!(text, "two");
    }

    #[tokio::test]
    async fn test_decode_stream_transport_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(frame("one").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let err = decode_stream(futures_util::stream::iter(chunks), conversation_text)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { status: None, .. }));
    }
}
