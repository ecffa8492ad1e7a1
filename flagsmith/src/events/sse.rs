//! Server-sent events transport for push updates.
//!
//! [`SseParser`] turns arbitrary byte chunks into dispatched events following
//! the `text/event-stream` framing: `field: value` lines, blank line
//! dispatch, `\n`, `\r\n` or `\r` line endings, `:` comments.
use crate::FlagsmithError;
use async_trait::async_trait;
use flagsmith_config::{
    FlagsmithConfig,
    http::{ENVIRONMENT_KEY_HEADER, build_event_stream_client},
};
use futures_util::{Stream, StreamExt, stream};
use reqwest::header;
use std::{collections::VecDeque, pin::Pin};
use tracing::debug;
use url::Url;

/// Longest line accepted before the stream is considered broken.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it. Fails once an
    /// unterminated line grows past [`MAX_LINE_BYTES`]; the parser is reset
    /// and the connection should be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, FlagsmithError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let consumed = if self.buffer[pos] == b'\r' {
                match self.buffer.get(pos + 1) {
                    // a trailing `\r` may be the first half of `\r\n`
                    None => break,
                    Some(b'\n') => pos + 2,
                    Some(_) => pos + 1,
                }
            } else {
                pos + 1
            };
            let line: Vec<u8> = self.buffer.drain(..consumed).take(pos).collect();
            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let pending = self.buffer.len();
            *self = Self::default();
            return Err(FlagsmithError::Stream(format!(
                "unterminated line of {pending} bytes exceeds {MAX_LINE_BYTES}"
            )));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
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
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry) = value.parse() {
                    self.retry = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.last_id.clone(),
            retry: self.retry,
        })
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, FlagsmithError>> + Send>>;

/// Something that can open the push-update stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<EventStream, FlagsmithError>;
}

/// Push updates over `GET {event_source_base_url}sse/environments/{key}/stream`.
pub struct HttpEventSource {
    client: reqwest::Client,
    url: Url,
    environment_key: String,
}

impl HttpEventSource {
    pub fn new(config: &FlagsmithConfig) -> Result<Self, FlagsmithError> {
        Ok(Self {
            client: build_event_stream_client(config)?,
            url: config.event_stream_url()?,
            environment_key: config.environment_key.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> Result<EventStream, FlagsmithError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ENVIRONMENT_KEY_HEADER, &self.environment_key)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlagsmithError::Server {
                status: status.as_u16(),
                body,
            });
        }
        debug!(url = %self.url, "event stream connected");

        let chunks = Box::pin(response.bytes_stream());
        let events = stream::unfold(
            (chunks, SseParser::new(), VecDeque::new()),
            |(mut chunks, mut parser, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (chunks, parser, pending)));
                    }
                    match chunks.next().await {
                        Some(Ok(chunk)) => match parser.push(&chunk) {
                            Ok(events) => pending.extend(events),
                            Err(err) => return Some((Err(err), (chunks, parser, pending))),
                        },
                        Some(Err(err)) => {
                            return Some((Err(FlagsmithError::Network(err)), (chunks, parser, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(events))
    }
}
