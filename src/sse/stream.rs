//! Stream adapter over a chat-completion response body
//!
//! Wraps any byte stream (a hyper body, an axum `BodyDataStream`, a test
//! iterator) and yields decoded [`DeltaEvent`]s. Reads are pulled one at a
//! time and only when the previously decoded events have been consumed.

use bytes::Bytes;
use futures_util::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::decoder::{DecoderLimits, DeltaEvent, EventDecoder};

/// A stream of content deltas decoded from an SSE byte stream.
///
/// The stream yields [`DeltaEvent::Done`] when the sentinel is seen and then
/// ends without polling the inner stream again. If the inner stream ends
/// first, the stream simply ends; callers can tell the two apart with
/// [`saw_sentinel`](Self::saw_sentinel).
pub struct DeltaStream<S> {
    inner: S,
    decoder: EventDecoder,
    ready: VecDeque<DeltaEvent>,
    terminated: bool,
}

impl<S> DeltaStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limits(inner, DecoderLimits::default())
    }

    pub fn with_limits(inner: S, limits: DecoderLimits) -> Self {
        Self {
            inner,
            decoder: EventDecoder::with_limits(limits),
            ready: VecDeque::new(),
            terminated: false,
        }
    }

    pub fn saw_sentinel(&self) -> bool {
        self.decoder.is_finished()
    }
}

impl<S, E> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<DeltaEvent, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            if this.terminated || this.decoder.is_finished() {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.ready.extend(this.decoder.feed(&chunk));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.terminated = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.terminated = true;
                    this.decoder.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
