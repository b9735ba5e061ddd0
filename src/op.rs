use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flume::{Receiver, TryRecvError};
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::task::AtomicWaker;

use crate::error::Error;
use crate::proxy::Proxy;
use crate::value::Value;

/// Completion future of an enqueued operation.
///
/// It resolves exactly once, on the event-loop thread that runs the resolution hand-off.
#[must_use = "an operation runs regardless, but its result is only observed by awaiting"]
pub struct Op<T: Completable> {
    data: Option<T>,
    result_receiver: Receiver<Result<Value, Error>>,
    waker: Arc<AtomicWaker>,
}

impl<T: Completable> Op<T> {
    pub(crate) fn new(
        data: T,
        result_receiver: Receiver<Result<Value, Error>>,
        waker: Arc<AtomicWaker>,
    ) -> Self {
        Self {
            data: Some(data),
            result_receiver,
            waker,
        }
    }

    fn complete(&mut self, result: Result<Value, Error>) -> T::Output {
        self.data
            .take()
            .expect("operation completion polled after ready")
            .complete(result)
    }
}

impl<T: Completable> Future for Op<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.result_receiver.try_recv() {
            Err(TryRecvError::Empty) => {
                self.waker.register(cx.waker());

                // make sure when we register a new waker, we won't miss the ready event because
                // the resolver used the old waker to wake us
                match self.result_receiver.try_recv() {
                    Err(TryRecvError::Empty) => Poll::Pending,
                    Err(TryRecvError::Disconnected) => {
                        Poll::Ready(self.complete(Err(Error::Disconnected)))
                    }
                    Ok(result) => Poll::Ready(self.complete(result)),
                }
            }

            Err(TryRecvError::Disconnected) => Poll::Ready(self.complete(Err(Error::Disconnected))),
            Ok(result) => Poll::Ready(self.complete(result)),
        }
    }
}

pub trait Completable: Send + Unpin + 'static {
    type Output;

    fn complete(self, result: Result<Value, Error>) -> Self::Output;
}

/// Result of a resource method or interaction.
#[derive(Debug)]
pub struct Call;

impl Completable for Call {
    type Output = Result<Value, Error>;

    fn complete(self, result: Result<Value, Error>) -> Self::Output {
        result
    }
}

/// Result of an open, the proxy wrapping the freshly opened resource.
#[derive(Debug)]
pub struct Opened;

impl Completable for Opened {
    type Output = Result<Proxy, Error>;

    fn complete(self, result: Result<Value, Error>) -> Self::Output {
        match result? {
            Value::Proxy(proxy) => Ok(proxy),
            other => unreachable!("open resolved with {other}"),
        }
    }
}

#[derive(Debug)]
pub struct Stopped;

impl Completable for Stopped {
    type Output = Result<(), Error>;

    fn complete(self, result: Result<Value, Error>) -> Self::Output {
        result.map(|_| ())
    }
}

/// Completes once every runner has processed its stop operation.
///
/// Every clone waits on the same drain, so a later `stop()` does not finish early.
#[derive(Clone)]
#[must_use = "runners drain regardless, await to observe the end of the drain"]
pub struct Shutdown {
    drain: Shared<BoxFuture<'static, ()>>,
}

impl Shutdown {
    pub(crate) fn new(stops: Vec<Op<Stopped>>) -> Self {
        Self {
            drain: future::join_all(stops).map(|_| ()).boxed().shared(),
        }
    }
}

impl Future for Shutdown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.drain).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_shutdown_is_ready() {
        assert_eq!(Shutdown::new(vec![]).now_or_never(), Some(()));
    }

    #[test]
    fn test_pending_until_sent() {
        let (sender, receiver) = flume::bounded(1);
        let waker = Arc::new(AtomicWaker::new());
        let mut op = Op::new(Call, receiver, waker.clone());

        assert!((&mut op).now_or_never().is_none());

        sender.try_send(Ok(Value::Int(4))).unwrap();
        waker.wake();

        assert_eq!(op.now_or_never().unwrap().unwrap(), Value::Int(4));
    }

    #[test]
    fn test_shutdown_clones_share_the_drain() {
        let (sender, receiver) = flume::bounded(1);
        let waker = Arc::new(AtomicWaker::new());
        let shutdown = Shutdown::new(vec![Op::new(Stopped, receiver, waker.clone())]);
        let later = shutdown.clone();
        drop(shutdown);

        assert!(later.clone().now_or_never().is_none());

        sender.try_send(Ok(Value::Unit)).unwrap();
        waker.wake();

        assert_eq!(later.now_or_never(), Some(()));
    }
}
