//! The stream handed to callers.
//!
//! `ChatStream` owns the connection, its decoder and the provider translator.
//! States: `Open` (reading), `Draining` (terminal chunk seen, buffered chunks
//! still being handed out), `Closed`. Transitions happen on the terminal chunk,
//! on an error, or on `close`. A single instance is read by one consumer.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, TryStreamExt};
use tokio::io::BufReader;
use tokio_util::io::StreamReader;

use super::decoder::{ByteReader, StreamDecoder};
use super::detect::detect_format;
use super::event::StreamFormat;
use super::factory::DecoderFactory;
use super::translator::StreamTranslator;
use crate::context::{RequestContext, deadline_error, sleep_until_opt};
use crate::error::{ErrorKind, LlmError};
use crate::http::{HttpInterceptor, HttpRequestContext};
use crate::types::{ChatCompletionChunk, ToolCall, ToolCallDelta, Usage, finish_reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Draining,
    Closed,
}

/// Summary passed to the completion hook exactly once per stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub chunks: usize,
    pub usage: Option<Usage>,
    pub finish_reason: String,
    /// `None` for a clean finish.
    pub error: Option<ErrorKind>,
    /// Closed by the caller before the terminal chunk.
    pub aborted: bool,
}

pub type CompletionHook = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Result of draining a stream to the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

pub struct ChatStream {
    provider: String,
    state: StreamState,
    reader: Option<Box<ByteReader>>,
    decoder: Box<dyn StreamDecoder>,
    translator: Box<dyn StreamTranslator>,
    pending: VecDeque<ChatCompletionChunk>,
    ctx: RequestContext,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    http_ctx: Option<HttpRequestContext>,
    emitted: usize,
    skipped: Option<LlmError>,
    usage: Option<Usage>,
    finish_reason: String,
    on_complete: Option<CompletionHook>,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("format", &self.decoder.format())
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}

/// Wrap a response body as a buffered async reader.
pub fn response_reader(response: reqwest::Response) -> Box<ByteReader> {
    let bytes = response
        .bytes_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));
    Box::new(BufReader::new(StreamReader::new(Box::pin(bytes))))
}

impl ChatStream {
    pub fn new(
        provider: impl Into<String>,
        reader: Box<ByteReader>,
        decoder: Box<dyn StreamDecoder>,
        translator: Box<dyn StreamTranslator>,
        ctx: RequestContext,
    ) -> Self {
        Self {
            provider: provider.into(),
            state: StreamState::Open,
            reader: Some(reader),
            decoder,
            translator,
            pending: VecDeque::new(),
            ctx,
            interceptors: Vec::new(),
            http_ctx: None,
            emitted: 0,
            skipped: None,
            usage: None,
            finish_reason: String::new(),
            on_complete: None,
        }
    }

    /// Build a stream from an HTTP response, choosing the decoder from the
    /// response's `Content-Type` or first bytes, else `fallback`.
    pub async fn from_response(
        provider: impl Into<String>,
        response: reqwest::Response,
        factory: &DecoderFactory,
        fallback: StreamFormat,
        translator: Box<dyn StreamTranslator>,
        ctx: RequestContext,
    ) -> Result<Self, LlmError> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut reader = response_reader(response);
        let detected = ctx
            .run(detect_format(content_type.as_deref(), reader.as_mut()))
            .await?;
        let format = match detected {
            Some(fmt) if factory.supports(&fmt) => fmt,
            _ => fallback,
        };
        let provider = provider.into();
        tracing::debug!(target: "infergate::stream", provider = %provider, format = %format, content_type = ?content_type, "opening stream");
        let decoder = factory.create(&format)?;
        Ok(Self::new(provider, reader, decoder, translator, ctx))
    }

    pub fn with_interceptors(
        mut self,
        interceptors: Vec<Arc<dyn HttpInterceptor>>,
        http_ctx: HttpRequestContext,
    ) -> Self {
        self.interceptors = interceptors;
        self.http_ctx = Some(http_ctx);
        self
    }

    /// Register a hook that runs once when the stream finishes, fails, or is closed.
    pub fn on_complete(mut self, hook: impl FnOnce(StreamOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Chain an extra hook after any existing one.
    pub fn add_completion_hook(mut self, hook: impl FnOnce(StreamOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(match self.on_complete.take() {
            Some(prev) => Box::new(move |outcome: StreamOutcome| {
                prev(outcome.clone());
                hook(outcome);
            }),
            None => Box::new(hook),
        });
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn format(&self) -> StreamFormat {
        self.decoder.format()
    }

    /// Next chunk, or `Ok(None)` once the stream has ended.
    ///
    /// After an error is returned, later calls return `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<ChatCompletionChunk>, LlmError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                self.observe(&chunk);
                return Ok(Some(chunk));
            }
            match self.state {
                StreamState::Closed => return Ok(None),
                StreamState::Draining => {
                    self.release(None, false);
                    return Ok(None);
                }
                StreamState::Open => {}
            }

            if self.ctx.is_cancelled() {
                return Err(self.fail(LlmError::Cancelled));
            }
            if self.ctx.is_expired() {
                return Err(self.fail(deadline_error()));
            }

            let token = self.ctx.token().clone();
            let deadline = self.ctx.deadline_instant();
            let Some(reader) = self.reader.as_mut() else {
                self.state = StreamState::Closed;
                return Ok(None);
            };
            let decoded = tokio::select! {
                biased;
                _ = token.cancelled() => Err(LlmError::Cancelled),
                _ = sleep_until_opt(deadline) => Err(deadline_error()),
                res = self.decoder.decode(reader.as_mut()) => res,
            };

            match decoded {
                Ok(Some(event)) => {
                    if let Some(hctx) = &self.http_ctx {
                        let mut hook_err = None;
                        for it in &self.interceptors {
                            if let Err(e) = it.on_stream_event(hctx, &event) {
                                hook_err = Some(e);
                                break;
                            }
                        }
                        if let Some(e) = hook_err {
                            return Err(self.fail(e));
                        }
                    }
                    match self.translator.translate(&event) {
                        Ok(chunks) => self.enqueue(chunks),
                        Err(e) if e.is_skippable_decode_error() => self.skip(e),
                        Err(e) => return Err(self.fail(e)),
                    }
                }
                Ok(None) => self.end_of_transport()?,
                Err(e) if e.is_skippable_decode_error() => self.skip(e),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn observe(&mut self, chunk: &ChatCompletionChunk) {
        self.emitted += 1;
        if let Some(u) = &chunk.usage {
            match &mut self.usage {
                Some(existing) => existing.merge(u),
                None => self.usage = Some(*u),
            }
        }
        if !chunk.finish_reason.is_empty() {
            self.finish_reason = chunk.finish_reason.clone();
        }
    }

    /// Queue chunks up to and including the first terminal one.
    fn enqueue(&mut self, chunks: Vec<ChatCompletionChunk>) {
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let done = chunk.done;
            self.pending.push_back(chunk);
            if done {
                self.state = StreamState::Draining;
                self.reader = None;
                break;
            }
        }
    }

    fn skip(&mut self, err: LlmError) {
        tracing::warn!(target: "infergate::stream", provider = %self.provider, err = %err, "skipping malformed stream event");
        if self.skipped.is_none() {
            self.skipped = Some(err);
        }
    }

    fn end_of_transport(&mut self) -> Result<(), LlmError> {
        self.reader = None;
        let chunks = match self.translator.finish() {
            Ok(chunks) => chunks,
            Err(e) => return Err(self.fail(e)),
        };
        self.enqueue(chunks);
        if self.state == StreamState::Draining {
            return Ok(());
        }
        if self.emitted == 0
            && self.pending.is_empty()
            && let Some(err) = self.skipped.take()
        {
            return Err(self.fail(err));
        }
        tracing::warn!(target: "infergate::stream", provider = %self.provider, "stream ended without a terminal event");
        let (id, model) = self.translator.identity();
        self.pending
            .push_back(ChatCompletionChunk::terminal(id, model, finish_reason::NONE));
        self.state = StreamState::Draining;
        Ok(())
    }

    fn fail(&mut self, err: LlmError) -> LlmError {
        let err = err.with_context(self.provider.clone(), "stream");
        self.release(Some(err.kind()), false);
        err
    }

    fn release(&mut self, error: Option<ErrorKind>, aborted: bool) {
        self.state = StreamState::Closed;
        self.reader = None;
        self.pending.clear();
        if let Some(hook) = self.on_complete.take() {
            hook(StreamOutcome {
                chunks: self.emitted,
                usage: self.usage,
                finish_reason: self.finish_reason.clone(),
                error,
                aborted,
            });
        }
    }

    /// Release the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        let aborted = self.state == StreamState::Open;
        self.release(None, aborted);
    }

    /// Drain the stream and assemble the full response.
    pub async fn collect(mut self) -> Result<ChatResponse, LlmError> {
        let mut response = ChatResponse::default();
        let mut deltas: Vec<ToolCallDelta> = Vec::new();
        while let Some(chunk) = self.next().await? {
            if response.id.is_empty() {
                response.id = chunk.id.clone();
            }
            if response.model.is_empty() {
                response.model = chunk.model.clone();
            }
            if let Some(text) = &chunk.content {
                response.content.push_str(text);
            }
            if let Some(calls) = chunk.tool_calls {
                deltas.extend(calls);
            }
            if !chunk.finish_reason.is_empty() {
                response.finish_reason = chunk.finish_reason.clone();
            }
            if chunk.usage.is_some() {
                response.usage = chunk.usage;
            }
        }
        let mut acc = super::tool_calls::ToolCallAccumulator::new();
        for d in &deltas {
            acc.apply(d);
        }
        response.tool_calls = acc.finish()?;
        Ok(response)
    }

    /// Drain the stream and concatenate the content deltas.
    pub async fn collect_text(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await? {
            if let Some(c) = &chunk.content {
                text.push_str(c);
            }
        }
        Ok(text)
    }

    /// Adapt into a `futures::Stream`. The stream ends after the first error.
    pub fn into_stream(
        mut self,
    ) -> Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, LlmError>> + Send>> {
        Box::pin(async_stream::stream! {
            loop {
                match self.next().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{NdjsonDecoder, SseDecoder, StreamEvent};
    use std::sync::Mutex;

    /// Echoes each event's data as content; `END` terminates.
    struct Echo {
        finish_on_eof: bool,
    }

    impl StreamTranslator for Echo {
        fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError> {
            match event.data.as_str() {
                "END" => Ok(vec![ChatCompletionChunk::terminal("r", "m", "stop")]),
                "BOOM" => Err(LlmError::api_error(500, "provider exploded")),
                "BAD" => Err(LlmError::ParseError("bad json".into())),
                text => Ok(vec![ChatCompletionChunk::content("r", "m", text)]),
            }
        }

        fn finish(&mut self) -> Result<Vec<ChatCompletionChunk>, LlmError> {
            if self.finish_on_eof {
                Ok(vec![ChatCompletionChunk::terminal("r", "m", "length")])
            } else {
                Ok(Vec::new())
            }
        }

        fn identity(&self) -> (String, String) {
            ("r".into(), "m".into())
        }
    }

    fn sse_stream(input: &'static [u8], finish_on_eof: bool) -> ChatStream {
        ChatStream::new(
            "test",
            Box::new(input),
            Box::new(SseDecoder::new()),
            Box::new(Echo { finish_on_eof }),
            RequestContext::new(),
        )
    }

    #[tokio::test]
    async fn exactly_one_terminal_chunk_last() {
        let mut s = sse_stream(b"data: a\n\ndata: END\n\ndata: after\n\n", false);
        let mut chunks = Vec::new();
        while let Some(c) = s.next().await.unwrap() {
            chunks.push(c);
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].done);
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        assert_eq!(s.state(), StreamState::Closed);
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_without_terminal_synthesizes_one() {
        let mut s = sse_stream(b"data: a\n\n", false);
        assert_eq!(s.next().await.unwrap().unwrap().text(), "a");
        let last = s.next().await.unwrap().unwrap();
        assert!(last.done);
        assert_eq!(last.finish_reason, "");
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn translator_finish_supplies_terminal() {
        let mut s = sse_stream(b"data: a\n\n", true);
        s.next().await.unwrap();
        let last = s.next().await.unwrap().unwrap();
        assert!(last.done);
        assert_eq!(last.finish_reason, "length");
    }

    #[tokio::test]
    async fn error_then_end_of_stream() {
        let mut s = sse_stream(b"data: a\n\ndata: BOOM\n\ndata: b\n\n", false);
        assert!(s.next().await.unwrap().is_some());
        let err = s.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.provider(), Some("test"));
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let mut s = sse_stream(b"data: BAD\n\ndata: ok\n\ndata: END\n\n", false);
        assert_eq!(s.next().await.unwrap().unwrap().text(), "ok");
        assert!(s.next().await.unwrap().unwrap().done);
    }

    #[tokio::test]
    async fn stream_of_only_garbage_surfaces_the_parse_error() {
        let mut s = ChatStream::new(
            "test",
            Box::new(&b"{nope\n{also nope\n"[..]),
            Box::new(NdjsonDecoder::new()),
            Box::new(Echo { finish_on_eof: false }),
            RequestContext::new(),
        );
        let err = s.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decoder);
    }

    #[tokio::test]
    async fn cancellation_checked_before_reading() {
        let ctx = RequestContext::new();
        let mut s = ChatStream::new(
            "test",
            Box::new(&b"data: a\n\n"[..]),
            Box::new(SseDecoder::new()),
            Box::new(Echo { finish_on_eof: false }),
            ctx.clone(),
        );
        ctx.cancel();
        let err = s.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(s.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_read() {
        let (client, _server) = tokio::io::duplex(64);
        let ctx = RequestContext::new();
        let mut s = ChatStream::new(
            "test",
            Box::new(BufReader::new(client)),
            Box::new(SseDecoder::new()),
            Box::new(Echo { finish_on_eof: false }),
            ctx.clone(),
        );
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = s.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_hook_runs_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let mut s = sse_stream(b"data: a\n\ndata: END\n\n", false)
            .on_complete(move |o| sink.lock().unwrap().push(o));
        s.next().await.unwrap();
        s.close();
        s.close();
        assert!(s.next().await.unwrap().is_none());
        drop(s);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].aborted);
        assert_eq!(calls[0].chunks, 1);
    }

    #[tokio::test]
    async fn collect_text_and_into_stream() {
        let text = sse_stream(b"data: Hello\n\ndata:  world\n\ndata: END\n\n", false)
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "Hello world");

        use futures::StreamExt;
        let items: Vec<_> = sse_stream(b"data: x\n\ndata: END\n\n", false)
            .into_stream()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(Result::is_ok));
    }
}
