//! Rate-limit bookkeeping from provider response headers.

pub mod info;
pub mod parsers;
pub mod tracker;

pub use info::{Counter, RateLimitInfo};
pub use parsers::{
    AnthropicRateLimitParser, CerebrasRateLimitParser, GenericRateLimitParser,
    OpenAiRateLimitParser, OpenRouterRateLimitParser, RateLimitParser, parse_duration,
};
pub use tracker::RateLimitTracker;
