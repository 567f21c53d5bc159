//! Pull-based consumer side of a streamed answer

use futures::Stream;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::sync::Arc;

use super::channel::{StreamItem, StreamQueue};
use crate::error::Result;
use crate::types::messages::ChatAnswer;

/// Shared future resolving to the final answer of a request
pub type AnswerFuture = Shared<BoxFuture<'static, Result<ChatAnswer>>>;

/// Streamed answer to one chat request
///
/// Use [`has_next`](Self::has_next) / [`next_chunk`](Self::next_chunk) or
/// the [`Iterator`] impl from a blocking context, or
/// [`into_async`](Self::into_async) from async code. Both end after the
/// last chunk; the full answer is available from [`done`](Self::done)
/// whether or not the chunks were drained.
///
/// Dropping the stream detaches it from its session without closing the
/// connection.
pub struct ChatStream {
    queue: Arc<StreamQueue>,
    done: AnswerFuture,
    peeked: Option<StreamItem>,
    ended: bool,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatStream")
            .field("queued", &self.queue.len())
            .field("finished", &self.queue.is_finished())
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl ChatStream {
    pub(crate) fn new(
        queue: Arc<StreamQueue>,
        done: AnswerFuture,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            queue,
            done,
            peeked: None,
            ended: false,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Block until the next chunk is available
    ///
    /// Returns `Ok(false)` after the terminal item or when the stream was
    /// deactivated. Blocks the calling thread; use from `spawn_blocking` or
    /// a plain thread.
    ///
    /// # Errors
    /// Returns the error carried by an error item (server error, response
    /// timeout, connection loss)
    pub fn has_next(&mut self) -> Result<bool> {
        if self.ended {
            return Ok(false);
        }
        if self.peeked.is_none() {
            self.peeked = self.queue.pop_blocking();
        }
        self.classify_peeked()
    }

    /// Take the chunk found by [`has_next`](Self::has_next), waiting for one
    /// if needed
    ///
    /// # Errors
    /// Same as [`has_next`](Self::has_next)
    pub fn next_chunk(&mut self) -> Result<Option<String>> {
        if self.has_next()? {
            Ok(self.peeked.take().map(|item| item.text))
        } else {
            Ok(None)
        }
    }

    /// Async counterpart of [`next_chunk`](Self::next_chunk)
    ///
    /// # Errors
    /// Same as [`has_next`](Self::has_next)
    pub async fn next_async(&mut self) -> Result<Option<String>> {
        if self.ended {
            return Ok(None);
        }
        if self.peeked.is_none() {
            self.peeked = self.queue.pop().await;
        }
        if self.classify_peeked()? {
            Ok(self.peeked.take().map(|item| item.text))
        } else {
            Ok(None)
        }
    }

    /// Convert into an async [`Stream`] of chunks
    pub fn into_async(mut self) -> impl Stream<Item = Result<String>> + Send {
        async_stream::stream! {
            loop {
                match self.next_async().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }

    /// Future resolving to the full answer once the terminal item was produced
    #[must_use]
    pub fn done(&self) -> AnswerFuture {
        self.done.clone()
    }

    fn classify_peeked(&mut self) -> Result<bool> {
        match &mut self.peeked {
            None => {
                self.ended = true;
                Ok(false)
            }
            Some(item) if item.error.is_some() => {
                self.ended = true;
                let err = item.error.take();
                self.peeked = None;
                err.map_or(Ok(false), Err)
            }
            Some(item) if item.done => {
                self.ended = true;
                self.peeked = None;
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }
}

impl Iterator for ChatStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.queue.deactivate();
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
