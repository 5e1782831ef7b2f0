use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::ErrorKind;
use crate::Result;

/// The outcome of one outstanding operation.
///
/// Every asynchronous operation ([`Device::connect`][crate::Device::connect],
/// [`Characteristic::read_value`][crate::Characteristic::read_value], ...) returns a `Pending` alongside invoking the
/// matching observer callback. It resolves exactly once. If the device disconnects (or is dropped from its manager)
/// while the operation is outstanding, it resolves to an error of kind
/// [`NotConnected`][crate::error::ErrorKind::NotConnected].
///
/// Dropping a `Pending` does not cancel the operation.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// The resolving side of a [`Pending`]
#[derive(Debug)]
pub(crate) struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

pub(crate) fn pending<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Pending { rx })
}

impl<T> Resolver<T> {
    pub fn resolve(self, result: Result<T>) {
        // The receiver may have been dropped
        let _ = self.tx.send(result);
    }
}

impl<T> Pending<T> {
    /// Returns the result if the operation has completed, without waiting.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ErrorKind::NotConnected.into())),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ErrorKind::NotConnected.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
