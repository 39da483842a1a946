//! Server-sent event decoding for streamed chat completions.
//!
//! Both providers stream `data: {json}` lines, each carrying one
//! `choices[0].delta.content` fragment, and close with `data: [DONE]` or by
//! simply ending the body. This module turns the raw HTTP byte stream into
//! lines and classifies each line.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::observability::{STREAM_BYTES, STREAM_ERRORS, STREAM_LINES};

/// Prefix of every payload line.
pub const DATA_PREFIX: &str = "data:";

/// Payload that marks the end of the stream.
pub const DONE_MARKER: &str = "[DONE]";

/// What a single line of the stream contributes to the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// A text fragment to print and append.
    Delta(String),
    /// Framing, keep-alives, role-only deltas, and anything unparseable.
    Skip,
    /// The explicit end-of-stream marker.
    Done,
}

/// Classifies one line of the event stream.
///
/// Parsing is structural: strip the `data:` prefix, parse the remainder as JSON,
/// and look up `choices[0].delta.content`. Lines that fail any step are skipped
/// rather than treated as errors.
pub fn decode_line(line: &str) -> StreamLine {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return StreamLine::Skip;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX).map(str::trim) else {
        debug!(line, "ignoring non-data line");
        return StreamLine::Skip;
    };
    if payload == DONE_MARKER {
        return StreamLine::Done;
    }
    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(payload, error = %err, "ignoring unparseable data line");
            return StreamLine::Skip;
        }
    };
    match value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
    {
        Some(fragment) if !fragment.is_empty() => StreamLine::Delta(fragment.to_string()),
        _ => StreamLine::Skip,
    }
}

/// Process a stream of bytes into a stream of classified lines.
///
/// Bytes are buffered until a full line is available, so chunk boundaries may
/// fall anywhere, including inside a multi-byte character. A final line without
/// a trailing newline is still decoded when the body ends.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<StreamLine>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + 'static,
{
    let stream = byte_stream.map(|result| result.map_err(body_error));

    let buffer: Vec<u8> = Vec::new();

    stream::unfold(
        (stream, buffer, false),
        move |(mut stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(line) = take_line(&mut buffer) {
                    return Some((line.map(|l| classify(&l)), (stream, buffer, false)));
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        STREAM_BYTES.count(bytes.len() as u64);
                        buffer.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer, true)));
                    }
                    None => {
                        if buffer.is_empty() {
                            return None;
                        }
                        let rest = std::mem::take(&mut buffer);
                        let line = decode_utf8(rest).map(|l| classify(&l));
                        return Some((line, (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

fn body_error(e: reqwest::Error) -> Error {
    STREAM_ERRORS.click();
    if e.is_timeout() {
        Error::timeout(format!("Stream timed out: {e}"), None)
    } else {
        Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
    }
}

fn classify(line: &str) -> StreamLine {
    STREAM_LINES.click();
    decode_line(line)
}

/// Removes the first complete line from `buffer`, without its newline.
fn take_line(buffer: &mut Vec<u8>) -> Option<Result<String>> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=newline).collect();
    line.pop();
    Some(decode_utf8(line))
}

fn decode_utf8(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line).map_err(|e| {
        STREAM_ERRORS.click();
        Error::encoding(format!("Invalid UTF-8 in stream: {e}"), Some(Box::new(e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<Result<StreamLine>> {
        process_sse(chunked(chunks)).collect().await
    }

    #[test]
    fn decode_delta_line() {
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            StreamLine::Delta("Hel".to_string())
        );
    }

    #[test]
    fn decode_skips_framing() {
        assert_eq!(decode_line(""), StreamLine::Skip);
        assert_eq!(decode_line("\r"), StreamLine::Skip);
        assert_eq!(decode_line(": keep-alive"), StreamLine::Skip);
        assert_eq!(decode_line("event: message"), StreamLine::Skip);
        assert_eq!(decode_line("data: {not json"), StreamLine::Skip);
    }

    #[test]
    fn decode_skips_role_only_and_empty_deltas() {
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            StreamLine::Skip
        );
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#),
            StreamLine::Skip
        );
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#),
            StreamLine::Skip
        );
    }

    #[test]
    fn decode_does_not_depend_on_field_order() {
        assert_eq!(
            decode_line(r#"data:{"id":"x","choices":[{"index":0,"delta":{"content":"ça"}}]}"#),
            StreamLine::Delta("ça".to_string())
        );
    }

    #[test]
    fn decode_done_marker() {
        assert_eq!(decode_line("data: [DONE]"), StreamLine::Done);
    }

    #[tokio::test]
    async fn lines_split_across_chunks() {
        let lines = collect(vec![
            &b"data: {\"choices\":[{\"delta\":"[..],
            &b"{\"content\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n"[..],
            &b"\ndata: [DONE]\n\n"[..],
        ])
        .await;
        let lines: Vec<StreamLine> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(
            lines,
            vec![
                StreamLine::Delta("Hel".to_string()),
                StreamLine::Skip,
                StreamLine::Delta("lo".to_string()),
                StreamLine::Skip,
                StreamLine::Done,
                StreamLine::Skip,
            ]
        );
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        // "é" is 0xC3 0xA9.
        let lines = collect(vec![
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"caf\xC3"[..],
            &b"\xA9\"}}]}\n"[..],
        ])
        .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0].as_ref().unwrap(),
            &StreamLine::Delta("café".to_string())
        );
    }

    #[tokio::test]
    async fn final_line_without_newline() {
        let lines = collect(vec![&b"data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}"[..]])
        .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), &StreamLine::Delta("end".to_string()));
    }

    #[tokio::test]
    async fn body_timeout_is_reported_as_timeout() {
        use std::time::Duration;
        use wiremock::matchers::any;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        let e = reqwest::Client::new()
            .get(server.uri())
            .timeout(Duration::from_millis(100))
            .send()
            .await
            .unwrap_err();
        let err = body_error(e);
        assert!(err.is_timeout(), "{err}");
        assert!(err.is_transport());

        let e = reqwest::get("http://127.0.0.1:1/").await.unwrap_err();
        let err = body_error(e);
        assert!(!err.is_timeout());
        assert!(matches!(err, Error::Streaming { .. }), "{err}");
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_encoding_error() {
        let lines = collect(vec![&b"data: \xFF\xFE\n"[..]])
        .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].as_ref().unwrap_err().is_decode());
    }
}
