//! Request Executor crate (spec.md §4.3, §6)
//!
//! The core's request path: given a selected [`cloud_code_pool::Pool`] and
//! an inbound Anthropic-shaped request, drive it through accounts and
//! endpoints until it succeeds, exhausts, or falls back to a different
//! model. Grounded on the teacher's `provider_impl.rs` retry shape and, for
//! the parts the teacher has no analogue for (rate-limit-aware scheduling,
//! smart backoff, empty-stream recovery), on the `token_manager` modules
//! pulled in from the wider example pack.

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod request;
pub mod sse;
pub mod time_fmt;
pub mod upstream;

pub use cancel::{CancelHandle, CancelSignal, never_cancelled};
pub use config::ExecutorConfig;
pub use error::{Error, Result};
pub use executor::{ExecuteOutcome, Executor};
pub use request::{AnthropicRequest, PassthroughRequestBuilder, RequestBuilder, is_thinking_class_model};
pub use sse::{ServerSentEvent, SseDecoder};
pub use upstream::{ReqwestUpstream, Upstream, UpstreamBody, UpstreamResponse};
