use crate::error::DecodeFault;
use crate::types::StreamMetadata;
use aho_corasick::AhoCorasick;
use anyhow::{bail, Context, Result};

pub const DEFAULT_META_START: &str = "<<<QUILL_META>>>";
pub const DEFAULT_META_END: &str = "<<<END_QUILL_META>>>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelPair {
    start: String,
    end: String,
}

impl SentinelPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Result<Self> {
        let start = start.into();
        let end = end.into();
        if start.is_empty() || end.is_empty() {
            bail!("metadata sentinels must not be empty");
        }
        if start.contains(&end) || end.contains(&start) {
            bail!("metadata sentinels must not contain each other ('{start}', '{end}')");
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }
}

impl Default for SentinelPair {
    fn default() -> Self {
        Self {
            start: DEFAULT_META_START.to_string(),
            end: DEFAULT_META_END.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    TextDelta(String),
    Metadata(StreamMetadata),
    Fault(DecodeFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Visible,
    InsideSpan,
}

/// Incremental decoder for a reply body that interleaves visible text with a
/// sentinel-delimited metadata span.
///
/// Concatenating every `TextDelta` yields the stream text with all spans
/// removed, however the bytes were chunked.
pub struct StreamDecoder {
    sentinels: SentinelPair,
    start_finder: AhoCorasick,
    end_finder: AhoCorasick,
    pending_bytes: Vec<u8>,
    buffer: String,
    state: ScanState,
    metadata_seen: bool,
}

impl StreamDecoder {
    pub fn new(sentinels: SentinelPair) -> Result<Self> {
        let start_finder = AhoCorasick::new([sentinels.start()])
            .context("failed to build start sentinel matcher")?;
        let end_finder =
            AhoCorasick::new([sentinels.end()]).context("failed to build end sentinel matcher")?;
        Ok(Self {
            sentinels,
            start_finder,
            end_finder,
            pending_bytes: Vec::new(),
            buffer: String::new(),
            state: ScanState::Visible,
            metadata_seen: false,
        })
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        self.pending_bytes.extend_from_slice(chunk);
        let decoded = take_utf8_prefix(&mut self.pending_bytes);
        self.buffer.push_str(&decoded);

        let mut events = Vec::new();
        self.drain_buffer(&mut events);
        events
    }

    /// Flushes everything withheld at end of stream.
    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.buffer.push_str(&tail);
            self.drain_buffer(&mut events);
        }

        match self.state {
            ScanState::Visible => {
                if !self.buffer.is_empty() {
                    events.push(DecodeEvent::TextDelta(std::mem::take(&mut self.buffer)));
                }
            }
            ScanState::InsideSpan => {
                // Everything after the start sentinel is withheld for good.
                self.buffer.clear();
                events.push(DecodeEvent::Fault(DecodeFault::Unterminated));
            }
        }
        events
    }

    fn drain_buffer(&mut self, events: &mut Vec<DecodeEvent>) {
        loop {
            match self.state {
                ScanState::Visible => {
                    if let Some(found) = self.start_finder.find(self.buffer.as_str()) {
                        if found.start() > 0 {
                            events.push(DecodeEvent::TextDelta(
                                self.buffer[..found.start()].to_string(),
                            ));
                        }
                        self.buffer.drain(..found.end());
                        self.state = ScanState::InsideSpan;
                        continue;
                    }

                    let held = partial_marker_suffix_len(&self.buffer, self.sentinels.start());
                    let emit_len = self.buffer.len() - held;
                    if emit_len > 0 {
                        let visible: String = self.buffer.drain(..emit_len).collect();
                        events.push(DecodeEvent::TextDelta(visible));
                    }
                    return;
                }
                ScanState::InsideSpan => {
                    let Some(found) = self.end_finder.find(self.buffer.as_str()) else {
                        return;
                    };
                    let payload = self.buffer[..found.start()].to_string();
                    self.buffer.drain(..found.end());
                    self.state = ScanState::Visible;
                    events.push(self.parse_span(&payload));
                }
            }
        }
    }

    fn parse_span(&mut self, payload: &str) -> DecodeEvent {
        if self.metadata_seen {
            return DecodeEvent::Fault(DecodeFault::Duplicate);
        }
        match serde_json::from_str::<StreamMetadata>(payload.trim()) {
            Ok(metadata) => {
                self.metadata_seen = true;
                DecodeEvent::Metadata(metadata)
            }
            Err(error) => DecodeEvent::Fault(DecodeFault::Malformed(error.to_string())),
        }
    }
}

/// Length of the longest buffer suffix that could still grow into `marker`.
fn partial_marker_suffix_len(buffer: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buffer.len());
    (1..=max)
        .rev()
        .find(|&len| {
            let split = buffer.len() - len;
            buffer.is_char_boundary(split) && marker.starts_with(&buffer[split..])
        })
        .unwrap_or(0)
}

/// Decodes the longest valid UTF-8 prefix, leaving an incomplete trailing
/// sequence in `bytes`. Invalid sequences become U+FFFD.
fn take_utf8_prefix(bytes: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(bytes.as_slice()) {
            Ok(text) => {
                out.push_str(text);
                bytes.clear();
                return out;
            }
            Err(error) => {
                let valid = error.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match error.error_len() {
                    Some(invalid) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        bytes.drain(..valid + invalid);
                    }
                    None => {
                        bytes.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> StreamDecoder {
        StreamDecoder::new(SentinelPair::new("<START>", "<END>").expect("sentinels"))
            .expect("decoder")
    }

    #[test]
    fn test_partial_marker_suffix_len() {
        assert_eq!(partial_marker_suffix_len("hello <ST", "<START>"), 3);
        assert_eq!(partial_marker_suffix_len("hello <", "<START>"), 1);
        assert_eq!(partial_marker_suffix_len("hello", "<START>"), 0);
        assert_eq!(partial_marker_suffix_len("", "<START>"), 0);
    }

    #[test]
    fn test_split_utf8_sequence_is_held_until_complete() {
        let mut decoder = decoder();
        let bytes = "你好".as_bytes();
        let first = decoder.process(&bytes[..2]);
        assert!(first.is_empty());
        let second = decoder.process(&bytes[2..]);
        assert_eq!(second, vec![DecodeEvent::TextDelta("你好".to_string())]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = decoder();
        let events = decoder.process(b"a\xffb");
        assert_eq!(events, vec![DecodeEvent::TextDelta("a\u{fffd}b".to_string())]);
    }

    #[test]
    fn test_partial_start_marker_is_flushed_as_text_at_close() {
        let mut decoder = decoder();
        let events = decoder.process(b"value <STA");
        assert_eq!(events, vec![DecodeEvent::TextDelta("value ".to_string())]);
        assert_eq!(
            decoder.finish(),
            vec![DecodeEvent::TextDelta("<STA".to_string())]
        );
    }

    #[test]
    fn test_sentinels_must_be_distinct() {
        assert!(SentinelPair::new("<M>", "<M>").is_err());
        assert!(SentinelPair::new("", "<END>").is_err());
        assert!(SentinelPair::new("<<", "<").is_err());
    }
}
