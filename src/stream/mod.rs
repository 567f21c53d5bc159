//! Streaming primitives
//!
//! - [`FastQueue`]: O(1) amortized FIFO with periodic compaction
//! - [`StreamQueue`]: blocking/async producer-consumer queue of [`StreamItem`]s
//! - [`ChatStream`]: the caller-facing iterator over a streamed answer

pub mod channel;
pub mod chat_stream;
pub mod queue;

pub use channel::{StreamItem, StreamQueue};
pub use chat_stream::{AnswerFuture, ChatStream};
pub use queue::FastQueue;
