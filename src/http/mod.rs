//! HTTP transport: pooled client, retry policy, interceptors and metrics.

pub mod client;
pub mod config;
pub mod headers;
pub mod interceptor;
pub mod metrics;
pub mod retry;

pub use client::{HttpClient, HttpRequest};
pub use config::HttpConfig;
pub use headers::HttpHeaderBuilder;
pub use interceptor::{HttpInterceptor, HttpRequestContext, LoggingInterceptor};
pub use metrics::{HttpMetrics, HttpMetricsSnapshot};
pub use retry::RetryPolicy;
