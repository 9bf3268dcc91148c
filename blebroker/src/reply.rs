use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::{Error, Result};

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

/// The eventual result of a request that completes asynchronously.
///
/// The request itself has already been submitted (or queued) by the time a
/// `Reply` is returned, so dropping it doesn't cancel anything, it only
/// discards the result.
///
/// If the connection or server that owns the request is torn down the reply
/// resolves to `Error::Closed`.
#[derive(Debug)]
#[must_use = "the result of the request is only observable by awaiting the Reply"]
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Reply<T> {
    pub(crate) fn channel() -> (Responder<T>, Reply<T>) {
        let (tx, rx) = oneshot::channel();
        (tx, Reply { rx })
    }

    /// A reply that is already resolved, used for requests rejected up front
    pub(crate) fn ready(result: Result<T>) -> Reply<T> {
        let (tx, reply) = Self::channel();
        let _ = tx.send(result);
        reply
    }

    /// Non-blocking check, mostly useful for tests
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
