//! Wire-dialect readers shared by the streaming adapters.
//!
//! Three dialect shapes exist across the supported vendors: newline-delimited
//! JSON (Ollama), SSE with a `[DONE]` sentinel (OpenAI-compatible), and SSE
//! with typed events (Anthropic). The readers here handle the byte-level
//! framing only; translating parsed frames into canonical chunks stays in
//! each provider module so the canonical types never bleed into the parsers.
//!
//! Buffering is bounded to a single in-flight event: a reader pulls bytes
//! from the source only when it needs another line.

use std::collections::VecDeque;
use std::marker::PhantomData;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use crate::error::{LlmError, Result};

/// Byte stream from an HTTP response body, with transport errors already
/// mapped into the crate taxonomy.
pub(crate) type ByteSource = BoxStream<'static, Result<Bytes>>;

/// Incremental splitter of a byte stream into text lines.
///
/// Lines may span byte-chunk boundaries; a trailing unterminated line is
/// flushed at end of stream. `\r\n` endings are normalized.
pub(crate) struct LineReader {
    source: ByteSource,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    eof: bool,
}

impl LineReader {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            source,
            buf: Vec::new(),
            pending: VecDeque::new(),
            eof: false,
        }
    }

    /// Next complete line without its terminator, or `None` at end of
    /// stream. Transport errors surface here, never as silent termination.
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buf);
                return Ok(Some(Self::decode(rest)));
            }
            match self.source.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                    self.drain_complete_lines();
                }
                Some(Err(err)) => return Err(err),
                None => self.eof = true,
            }
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.pending.push_back(Self::decode(line));
        }
    }

    fn decode(mut bytes: Vec<u8>) -> String {
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Dialect A: one JSON document per line (Ollama).
///
/// Empty lines are skipped; a line that fails to decode is an
/// [`LlmError::InvalidResponse`].
pub(crate) struct JsonLinesReader<T> {
    lines: LineReader,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> JsonLinesReader<T> {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            lines: LineReader::new(source),
            _marker: PhantomData,
        }
    }

    pub(crate) async fn next(&mut self) -> Result<Option<T>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    let value = serde_json::from_str(&line).map_err(|err| {
                        LlmError::InvalidResponse(format!("bad stream line: {err}"))
                    })?;
                    return Ok(Some(value));
                }
            }
        }
    }
}

/// One Server-Sent Event: optional `event:` type plus the joined `data:`
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) event: Option<String>,
    pub(crate) data: String,
}

/// Dialects B and C: Server-Sent Events.
///
/// Accumulates `event:` and `data:` fields until a blank line terminates the
/// record. Multiple `data:` lines join with `\n` per the SSE spec; comment
/// and unknown fields are ignored. A pending record is flushed at end of
/// stream so a missing final blank line does not drop the last event.
pub(crate) struct SseReader {
    lines: LineReader,
}

impl SseReader {
    pub(crate) fn new(source: ByteSource) -> Self {
        Self {
            lines: LineReader::new(source),
        }
    }

    pub(crate) async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        let mut event: Option<String> = None;
        let mut data: Vec<String> = Vec::new();

        loop {
            match self.lines.next_line().await? {
                None => {
                    if event.is_none() && data.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(SseEvent {
                        event,
                        data: data.join("\n"),
                    }));
                }
                Some(line) => {
                    if line.is_empty() {
                        if event.is_some() || !data.is_empty() {
                            return Ok(Some(SseEvent {
                                event,
                                data: data.join("\n"),
                            }));
                        }
                        continue;
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("event:") {
                        event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                    }
                }
            }
        }
    }
}

/// Build a byte source from fixed byte chunks. Test helper for driving the
/// readers without a live HTTP body.
#[cfg(test)]
pub(crate) fn byte_source_from<C>(chunks: Vec<C>) -> ByteSource
where
    C: AsRef<[u8]> + Send + 'static,
{
    futures::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_ref()))),
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_line_reader_basic() {
        let mut reader = LineReader::new(byte_source_from(vec![b"one\ntwo\nthree\n"]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(reader.next_line().await.unwrap(), None);
        // End of stream is stable across repeated reads.
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_line_spanning_chunks() {
        let mut reader = LineReader::new(byte_source_from(vec![
            b"hel".as_slice(),
            b"lo wo".as_slice(),
            b"rld\nnext\n".as_slice(),
        ]));
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("hello world")
        );
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("next"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_crlf_and_trailing_line() {
        let mut reader = LineReader::new(byte_source_from(vec![b"a\r\nb\r\ntail"]));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("b"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_surfaces_transport_errors() {
        let source: ByteSource = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ok\n")),
            Err(LlmError::Network("reset".to_string())),
        ])
        .boxed();
        let mut reader = LineReader::new(source);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ok"));
        assert!(matches!(
            reader.next_line().await,
            Err(LlmError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_json_lines_reader() {
        #[derive(serde::Deserialize)]
        struct Row {
            n: u32,
        }
        let mut reader: JsonLinesReader<Row> =
            JsonLinesReader::new(byte_source_from(vec![b"{\"n\":1}\n\n{\"n\":2}\n"]));
        assert_eq!(reader.next().await.unwrap().unwrap().n, 1);
        assert_eq!(reader.next().await.unwrap().unwrap().n, 2);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_lines_reader_rejects_bad_line() {
        #[derive(serde::Deserialize)]
        struct Row {
            #[allow(dead_code)]
            n: u32,
        }
        let mut reader: JsonLinesReader<Row> =
            JsonLinesReader::new(byte_source_from(vec![b"not json\n"]));
        assert!(matches!(
            reader.next().await,
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_sse_reader_data_only_events() {
        let mut reader =
            SseReader::new(byte_source_from(vec![b"data: one\n\ndata: two\n\n"]));
        let first = reader.next_event().await.unwrap().unwrap();
        assert_eq!(first.event, None);
        assert_eq!(first.data, "one");
        let second = reader.next_event().await.unwrap().unwrap();
        assert_eq!(second.data, "two");
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sse_reader_typed_events() {
        let body: &[u8] =
            b"event: message_start\ndata: {\"a\":1}\n\nevent: ping\ndata: {}\n\n";
        let mut reader = SseReader::new(byte_source_from(vec![body]));
        let first = reader.next_event().await.unwrap().unwrap();
        assert_eq!(first.event.as_deref(), Some("message_start"));
        assert_eq!(first.data, "{\"a\":1}");
        let second = reader.next_event().await.unwrap().unwrap();
        assert_eq!(second.event.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_sse_reader_multiline_data_joined() {
        let mut reader =
            SseReader::new(byte_source_from(vec![b"data: first\ndata: second\n\n"]));
        let event = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event.data, "first\nsecond");
    }

    #[tokio::test]
    async fn test_sse_reader_ignores_comments_and_flushes_at_eof() {
        let mut reader =
            SseReader::new(byte_source_from(vec![b": keepalive\ndata: tail"]));
        let event = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event.data, "tail");
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sse_reader_skips_leading_blank_lines() {
        let mut reader = SseReader::new(byte_source_from(vec![b"\n\ndata: x\n\n"]));
        let event = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event.data, "x");
    }
}
