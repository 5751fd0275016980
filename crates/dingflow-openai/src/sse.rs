// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-delimited `data:` stream decoder.
//!
//! The backend sends one record per line: `data: <json>`. Lines that are
//! blank, are not `data:` lines, are not UTF-8, exceed the length limit or
//! carry malformed JSON are skipped. The literal `data: [DONE]` ends the
//! sequence even if more bytes follow. Only read failures end it early.

use std::future::ready;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use dingflow_core::DingflowError;
use dingflow_core::types::TextStream;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::types::ChatCompletionChunk;

/// End-of-stream sentinel payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest line that is parsed; longer lines are dropped.
const MAX_LINE_BYTES: usize = 1 << 20;

/// What a single line of the stream means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

/// Interprets one line of the stream.
pub fn parse_line(line: &str) -> LineEvent {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return LineEvent::Skip;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return LineEvent::Done;
    }
    match serde_json::from_str::<ChatCompletionChunk>(payload) {
        Ok(chunk) => chunk.into_text().map_or(LineEvent::Skip, LineEvent::Delta),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream line");
            LineEvent::Skip
        }
    }
}

/// A raw line cut from the body.
#[derive(Debug, PartialEq, Eq)]
enum RawLine {
    Line(Bytes),
    /// A line longer than the limit; its bytes were discarded.
    Oversized,
}

impl RawLine {
    fn event(self) -> LineEvent {
        match self {
            Self::Line(bytes) => match std::str::from_utf8(&bytes) {
                Ok(line) => parse_line(line),
                Err(e) => {
                    debug!(error = %e, "skipping stream line that is not UTF-8");
                    LineEvent::Skip
                }
            },
            Self::Oversized => {
                debug!(limit = MAX_LINE_BYTES, "skipping oversized stream line");
                LineEvent::Skip
            }
        }
    }
}

/// Splits the body on `\n` without interpreting the bytes.
///
/// An over-long line is discarded up to its terminator and reported as
/// [`RawLine::Oversized`], after which splitting carries on.
#[derive(Debug)]
struct LineSplitter {
    max_len: usize,
    /// Bytes already searched for a terminator.
    scanned: usize,
    discarding: bool,
}

impl LineSplitter {
    fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
            discarding: false,
        }
    }

    fn take(&mut self, mut line: BytesMut) -> RawLine {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || line.len() > self.max_len {
            return RawLine::Oversized;
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        RawLine::Line(line.freeze())
    }
}

impl Decoder for LineSplitter {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        match buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line = buf.split_to(self.scanned + pos + 1);
                line.truncate(line.len() - 1);
                Ok(Some(self.take(line)))
            }
            None if buf.len() > self.max_len => {
                buf.clear();
                self.scanned = 0;
                self.discarding = true;
                Ok(None)
            }
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() && !self.discarding {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(self.take(rest)))
    }
}

/// Decodes a raw byte stream into text fragments.
///
/// Works on any chunking of the body: records split across chunks are
/// reassembled before parsing.
pub fn decode_byte_stream<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Buf + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    decode_with_limit(bytes, MAX_LINE_BYTES)
}

fn decode_with_limit<S, B, E>(bytes: S, max_line: usize) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Buf + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let reader = StreamReader::new(bytes.map_err(io::Error::other));
    let lines = FramedRead::new(reader, LineSplitter::new(max_line));

    let fragments = lines
        .map(|line| line.map(RawLine::event).map_err(read_error))
        .take_while(|event| ready(!matches!(event, Ok(LineEvent::Done))))
        .filter_map(|event| {
            ready(match event {
                Ok(LineEvent::Delta(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    Box::pin(fragments)
}

fn read_error(e: io::Error) -> DingflowError {
    DingflowError::Remote {
        status: None,
        message: format!("completion stream read failed: {e}"),
        source: Some(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    async fn collect(parts: Vec<&str>) -> Vec<Result<String, DingflowError>> {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .into_iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        decode_byte_stream(futures::stream::iter(owned))
            .collect()
            .await
    }

    #[test]
    fn parse_line_variants() {
        assert_eq!(parse_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(parse_line("data:[DONE]"), LineEvent::Done);
        assert_eq!(parse_line(""), LineEvent::Skip);
        assert_eq!(parse_line(": keep-alive"), LineEvent::Skip);
        assert_eq!(parse_line("data: {not json"), LineEvent::Skip);
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            LineEvent::Skip
        );
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            LineEvent::Delta("hi".into())
        );
    }

    #[tokio::test]
    async fn yields_fragments_until_sentinel() {
        let first = chunk("hello ");
        let second = chunk("world");
        let after = chunk("ignored");
        let items = collect(vec![&first, &second, "data: [DONE]\n\n", &after]).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["hello ", "world"]);
    }

    #[tokio::test]
    async fn reassembles_records_split_across_chunks() {
        let whole = chunk("split");
        let (a, b) = whole.split_at(12);
        let items = collect(vec![a, b]).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "split");
    }

    #[tokio::test]
    async fn malformed_lines_do_not_abort() {
        let good = chunk("ok");
        let items = collect(vec!["data: {broken\n", "garbage line\n", &good]).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["ok"]);
    }

    #[tokio::test]
    async fn connection_close_ends_without_sentinel() {
        let only = chunk("partial");
        let items = collect(vec![&only]).await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn read_errors_surface_as_items() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(chunk("before"))),
            Err(std::io::Error::other("reset by peer")),
        ];
        let items: Vec<_> = decode_byte_stream(futures::stream::iter(parts))
            .collect()
            .await;
        assert_eq!(items[0].as_ref().unwrap(), "before");
        assert!(items[1].as_ref().unwrap_err().is_transient());
    }

    async fn collect_bytes(parts: Vec<Vec<u8>>, max_line: usize) -> Vec<Result<String, DingflowError>> {
        let owned: Vec<Result<Bytes, std::io::Error>> =
            parts.into_iter().map(|p| Ok(Bytes::from(p))).collect();
        decode_with_limit(futures::stream::iter(owned), max_line)
            .collect()
            .await
    }

    #[tokio::test]
    async fn non_utf8_line_is_skipped() {
        let mut bad = br#"data: {"choices":[{"delta":{"content":""#.to_vec();
        bad.extend_from_slice(b"\xff\"}}]}\n");
        let items = collect_bytes(vec![bad, chunk("after").into_bytes()], MAX_LINE_BYTES).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["after"]);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped() {
        let long = chunk(&"x".repeat(200));
        let short = chunk("fits");
        // The long record arrives in pieces so the limit trips before its newline.
        let (head, tail) = long.split_at(100);
        let items = collect_bytes(
            vec![head.into(), tail.into(), short.into_bytes(), chunk(&"y".repeat(300)).into_bytes()],
            128,
        )
        .await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["fits"]);
    }

    #[tokio::test]
    async fn crlf_lines_and_unterminated_tail_are_parsed() {
        let first = format!(
            "data: {}\r\n",
            serde_json::json!({"choices": [{"delta": {"content": "a"}}]})
        );
        let last = format!(
            "data: {}",
            serde_json::json!({"choices": [{"delta": {"content": "b"}}]})
        );
        let items = collect(vec![first.as_str(), last.as_str()]).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }
}
