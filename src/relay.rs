//! Pull-based relay from the upstream event stream to [`StreamChunk`]s.
//!
//! Nothing is read from upstream until the caller polls, and dropping the
//! returned stream drops the upstream body, which closes the connection.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::upstream::{ByteStream, UpstreamFailure};
use crate::wire::decode::qwen::{StreamEvent, decode_stream_event};
use crate::wire::{DeltaPhase, FinishReason, StreamChunk, StreamEnd, Usage};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

type EventStream = Pin<
    Box<dyn Stream<Item = Result<eventsource_stream::Event, EventStreamError<UpstreamFailure>>> + Send>,
>;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
    /// Consecutive malformed events tolerated before the stream is abandoned.
    pub malformed_tolerance: u32,
}

impl RelayConfig {
    pub fn from_retry(config: &RetryConfig) -> Self {
        Self {
            idle_timeout: config.stream_idle_timeout(),
            malformed_tolerance: config.malformed_event_tolerance,
        }
    }
}

struct RelayState {
    events: Option<EventStream>,
    config: RelayConfig,
    next_index: u64,
    malformed: u32,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

/// Yields one chunk per relayed upstream delta and exactly one terminal chunk.
pub fn relay(upstream: ByteStream, config: RelayConfig) -> ChunkStream {
    let state = RelayState {
        events: Some(Box::pin(upstream.eventsource())),
        config,
        next_index: 0,
        malformed: 0,
        finish_reason: None,
        usage: None,
    };
    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        let chunk = state.next_chunk().await?;
        if chunk.is_terminal() {
            state.events = None;
        }
        Some((chunk, state))
    }))
}

impl RelayState {
    async fn next_chunk(&mut self) -> Option<StreamChunk> {
        loop {
            let events = self.events.as_mut()?;
            let next = match tokio::time::timeout(self.config.idle_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Some(self.interrupted(format!(
                        "upstream stream idle for {}ms",
                        self.config.idle_timeout.as_millis()
                    )));
                }
            };

            let event = match next {
                None => {
                    return Some(match self.finish_reason {
                        Some(reason) => self.stop(reason),
                        None => self.interrupted("upstream stream ended before completion"),
                    });
                }
                Some(Err(EventStreamError::Transport(err))) => {
                    return Some(self.interrupted(format!("upstream stream failed: {err}")));
                }
                Some(Err(err)) => {
                    if let Some(chunk) = self.malformed(err.to_string()) {
                        return Some(chunk);
                    }
                    continue;
                }
                Some(Ok(event)) => event,
            };

            match decode_stream_event(&event.data) {
                Ok(StreamEvent::Done) => {
                    return Some(self.stop(self.finish_reason.unwrap_or(FinishReason::Stop)));
                }
                Ok(StreamEvent::Failure(failure)) => {
                    return Some(self.interrupted(format!(
                        "upstream reported {}: {}",
                        failure.code.as_deref().unwrap_or("error"),
                        failure.message
                    )));
                }
                Ok(StreamEvent::Meta) => {
                    self.malformed = 0;
                }
                Ok(StreamEvent::Delta {
                    phase,
                    content,
                    finish_reason,
                    usage,
                }) => {
                    self.malformed = 0;
                    if usage.is_some() {
                        self.usage = usage;
                    }
                    if finish_reason.is_some() {
                        self.finish_reason = finish_reason;
                    }
                    if let Some(phase) = phase.filter(|_| !content.is_empty()) {
                        return Some(self.emit(phase, content, None));
                    }
                }
                Err(reason) => {
                    if let Some(chunk) = self.malformed(reason) {
                        return Some(chunk);
                    }
                }
            }
        }
    }

    fn malformed(&mut self, reason: String) -> Option<StreamChunk> {
        self.malformed += 1;
        tracing::warn!(consecutive = self.malformed, "skipping malformed upstream event: {reason}");
        if self.malformed > self.config.malformed_tolerance {
            Some(self.interrupted(format!(
                "{} consecutive malformed upstream events, last: {reason}",
                self.malformed
            )))
        } else {
            None
        }
    }

    fn stop(&mut self, finish_reason: FinishReason) -> StreamChunk {
        let usage = self.usage;
        self.emit(
            DeltaPhase::Answer,
            String::new(),
            Some(StreamEnd::Stop {
                finish_reason,
                usage,
            }),
        )
    }

    fn interrupted(&mut self, message: impl Into<String>) -> StreamChunk {
        let err = GatewayError::new(ErrorKind::StreamInterrupted, message);
        tracing::warn!(chunks = self.next_index, "{}", err);
        self.emit(DeltaPhase::Answer, String::new(), Some(StreamEnd::Error(err)))
    }

    fn emit(&mut self, phase: DeltaPhase, delta: String, end: Option<StreamEnd>) -> StreamChunk {
        let index = self.next_index;
        self.next_index += 1;
        StreamChunk {
            index,
            phase,
            delta,
            end,
        }
    }
}
