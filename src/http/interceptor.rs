//! HTTP Interceptor interfaces
//!
//! Interceptors can tweak request builders before send, inspect responses
//! before the body is read, be notified of errors, and observe decoded stream
//! events. Returning an error from `on_before_send` short-circuits the request;
//! returning one from `on_response` drops the response (closing its body) and
//! surfaces the error.

use crate::error::LlmError;
use crate::streaming::StreamEvent;
use reqwest::header::HeaderMap;

/// Context passed to interceptors describing the request.
#[derive(Clone, Debug)]
pub struct HttpRequestContext {
    pub provider_id: String,
    pub method: reqwest::Method,
    pub url: String,
    pub stream: bool,
    /// 0 for the first try, then 1, 2, ... for retries.
    pub attempt: u32,
    pub model: Option<String>,
}

pub trait HttpInterceptor: Send + Sync {
    fn on_before_send(
        &self,
        _ctx: &HttpRequestContext,
        builder: reqwest::RequestBuilder,
        _body: Option<&[u8]>,
        _headers: &HeaderMap,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        Ok(builder)
    }

    /// Called with every response, before its body is consumed.
    fn on_response(
        &self,
        _ctx: &HttpRequestContext,
        _response: &reqwest::Response,
    ) -> Result<(), LlmError> {
        Ok(())
    }

    fn on_error(&self, _ctx: &HttpRequestContext, _error: &LlmError) {}

    fn on_stream_event(
        &self,
        _ctx: &HttpRequestContext,
        _event: &StreamEvent,
    ) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Logs request lifecycle through `tracing`. Headers and bodies are never logged.
#[derive(Clone, Default)]
pub struct LoggingInterceptor;

impl HttpInterceptor for LoggingInterceptor {
    fn on_before_send(
        &self,
        ctx: &HttpRequestContext,
        builder: reqwest::RequestBuilder,
        body: Option<&[u8]>,
        _headers: &HeaderMap,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        tracing::debug!(
            target: "infergate::http",
            provider = %ctx.provider_id,
            method = %ctx.method,
            url = %ctx.url,
            stream = ctx.stream,
            attempt = ctx.attempt,
            body_len = body.map_or(0, <[u8]>::len),
            "sending request"
        );
        Ok(builder)
    }

    fn on_response(
        &self,
        ctx: &HttpRequestContext,
        response: &reqwest::Response,
    ) -> Result<(), LlmError> {
        tracing::debug!(target: "infergate::http", provider = %ctx.provider_id, url = %ctx.url, status = response.status().as_u16(), "response received");
        Ok(())
    }

    fn on_error(&self, ctx: &HttpRequestContext, error: &LlmError) {
        tracing::debug!(target: "infergate::http", provider = %ctx.provider_id, url = %ctx.url, stream = ctx.stream, err = %error, "request error");
    }

    fn on_stream_event(
        &self,
        ctx: &HttpRequestContext,
        event: &StreamEvent,
    ) -> Result<(), LlmError> {
        tracing::trace!(target: "infergate::http", provider = %ctx.provider_id, event_type = %event.event_type, data_len = event.data.len(), "stream event");
        Ok(())
    }
}
