//! Splitting raw response bytes into framed events.
//!
//! Anthropic, OpenAI and Gemini (with `alt=sse`) stream Server-Sent Events; Ollama streams
//! newline-delimited JSON. Chunks may split lines and UTF-8 sequences anywhere, so bytes are
//! buffered until a full line is available.

use super::events::RawEvent;
use crate::error::{CrosstalkError, Result};
use crate::llm::models::Provider;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
}

impl Framing {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Ollama => Framing::Ndjson,
            Provider::Anthropic | Provider::Gemini | Provider::OpenAI => Framing::Sse,
        }
    }

    pub fn decoder(self) -> Box<dyn FrameDecoder> {
        match self {
            Framing::Sse => Box::new(SseDecoder::new()),
            Framing::Ndjson => Box::new(NdjsonDecoder::new()),
        }
    }
}

/// Incremental byte-to-event decoder.
pub trait FrameDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent>;

    /// Flush whatever is buffered once the body ends.
    fn finish(&mut self) -> Vec<RawEvent>;
}

#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator.
    fn next_line(&mut self) -> Option<String> {
        let newline = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&mut self, line: &str) -> Option<RawEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" | "retry" => {}
            other => debug!(field = other, "Ignoring unknown SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(RawEvent::new(event, data))
    }
}

impl FrameDecoder for SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.lines.extend(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.lines.next_line() {
            events.extend(self.line(&line));
        }
        events
    }

    fn finish(&mut self) -> Vec<RawEvent> {
        let mut events = Vec::new();
        if let Some(rest) = self.lines.take_rest() {
            events.extend(self.line(&rest));
        }
        events.extend(self.dispatch());
        events
    }
}

#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for NdjsonDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.lines.extend(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.lines.next_line() {
            let line = line.trim();
            if !line.is_empty() {
                events.push(RawEvent::data(line));
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<RawEvent> {
        self.lines
            .take_rest()
            .filter(|rest| !rest.trim().is_empty())
            .map(|rest| RawEvent::data(rest.trim()))
            .into_iter()
            .collect()
    }
}

/// Frame a byte stream.
pub fn raw_events<S, B>(bytes: S, framing: Framing) -> impl Stream<Item = Result<RawEvent>> + Send
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send,
    B: AsRef<[u8]> + Send,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = framing.decoder();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.feed(chunk.as_ref()) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Stream body failed");
                    yield Err(e.into());
                    return;
                }
            }
        }

        for event in decoder.finish() {
            yield Ok(event);
        }
    }
}

/// Frame a streaming HTTP response. Non-success statuses become [`CrosstalkError::UpstreamError`].
pub fn response_events(
    response: reqwest::Response,
    framing: Framing,
) -> Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>> {
    Box::pin(async_stream::stream! {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            yield Err(CrosstalkError::UpstreamError {
                kind: status.as_str().to_string(),
                message,
            });
            return;
        }

        let events = raw_events(response.bytes_stream(), framing);
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            yield event;
        }
    })
}
