//! HTTP push transport.
//!
//! - receive: `GET <endpoint>?roomId=<id>` with `Accept: text/event-stream`,
//!   one frame per SSE `data:` event
//! - send: `POST <endpoint>?roomId=<id>` with the frame as the body, `204`
//!   on success

use crate::transport::{FrameStream, PushTransport, Result, TransportError};
use async_trait::async_trait;
use collab_core::RoomId;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::collections::VecDeque;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// `endpoint` is the full collab URL, e.g. `http://host:8080/collab`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn open(&self, room: &RoomId) -> Result<FrameStream> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("roomId", room.as_str())])
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        debug!("Push stream open for room {}", room);

        let body = Box::pin(response.bytes_stream());
        let frames = futures::stream::unfold(
            (body, SseDecoder::default(), VecDeque::new()),
            |(mut body, mut decoder, mut pending)| async move {
                loop {
                    if let Some(frame) = pending.pop_front() {
                        return Some((Ok(frame), (body, decoder, pending)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            let err = TransportError::Stream(e.to_string());
                            return Some((Err(err), (body, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(frames.boxed())
    }

    async fn post(&self, room: &RoomId, frame: String) -> Result<()> {
        trace!("POST {} bytes to room {}", frame.len(), room);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("roomId", room.as_str())])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(frame)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Incremental `text/event-stream` decoder yielding the data of each event.
///
/// Comments (`:` lines, used for keep-alives) and fields other than `data`
/// are skipped. Multi-line data is joined with `\n`. Lines may end in `\n`,
/// `\r\n` or a bare `\r`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    /// Last line ended in `\r`; a leading `\n` belongs to it.
    after_cr: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.after_cr {
                match self.buffer.first() {
                    None => break,
                    Some(b'\n') => {
                        self.buffer.remove(0);
                    }
                    Some(_) => {}
                }
                self.after_cr = false;
            }

            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r') else {
                break;
            };
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.after_cr = line.pop() == Some(b'\r');
            self.line(&String::from_utf8_lossy(&line), &mut events);
        }
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if line.starts_with(':') {
            // comment
        } else if let Some(value) = line.strip_prefix("data") {
            match value.strip_prefix(':') {
                Some(value) => {
                    let value = value.strip_prefix(' ').unwrap_or(value);
                    self.data.push(value.to_string());
                }
                None if value.is_empty() => self.data.push(String::new()),
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push(b"data: abc\n\n"), vec!["abc"]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"da").is_empty());
        assert!(decoder.push(b"ta: hel").is_empty());
        assert!(decoder.push(b"lo\r\n").is_empty());
        assert_eq!(decoder.push(b"\r\n"), vec!["hello"]);
    }

    #[test]
    fn test_bare_carriage_return_ends_lines() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push(b"data: abc\rdata: def\r\r"), vec!["abc\ndef"]);

        // A CRLF split across chunks is one line ending, not two
        assert!(decoder.push(b"data: x\r").is_empty());
        assert!(decoder.push(b"\ndata: y\r").is_empty());
        assert_eq!(decoder.push(b"\n\n"), vec!["x\ny"]);
    }

    #[test]
    fn test_comments_and_keep_alives_skipped() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": connected\n\n:\n\ndata:x\n\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn test_multiline_and_other_fields() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: msg\nid: 7\ndata: a\ndata: b\n\ndata: c\n\n");
        assert_eq!(events, vec!["a\nb", "c"]);
    }

    #[test]
    fn test_incomplete_event_is_held() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: pending\n").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["pending"]);
    }
}
