use crate::types::GraphqlResponse;
use crate::{BoxStream, Result};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// Live subscription returned by [`GraphqlClient::subscribe`](crate::GraphqlClient::subscribe).
///
/// Each payload has already been normalized into the cache when it is
/// yielded. Cancelling (or dropping) the stream closes the underlying channel
/// and stops further cache writes; entries already committed stay.
pub struct SubscriptionStream {
    inner: BoxStream<'static, GraphqlResponse>,
    cancel: CancellationToken,
}

impl SubscriptionStream {
    pub(crate) fn new(inner: BoxStream<'static, GraphqlResponse>, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A handle that can cancel this subscription from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<GraphqlResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
