//! Asynchronous pixel readback.
//!
//! A [`ReadbackFuture`] owns the device's fence-backed [`ReadbackSource`].
//! Every poll checks the fence once. While it is pending the future wakes
//! itself so the executor polls again later; nothing blocks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::errors::{Result, TrellisError};
use crate::renderer::device::{ReadbackSource, ReadbackStatus};

type Decode<T> = Box<dyn FnOnce(Vec<u8>) -> Result<T> + Send>;

/// Resolves to the decoded pixels once the device signals completion.
pub struct ReadbackFuture<T = Vec<u8>> {
    source: Option<Box<dyn ReadbackSource>>,
    decode: Option<Decode<T>>,
    polls: u32,
}

impl ReadbackFuture<Vec<u8>> {
    /// Resolves to the raw bytes.
    #[must_use]
    pub fn new(source: Box<dyn ReadbackSource>) -> Self {
        Self::with_decoder(source, Ok)
    }
}

impl<T> ReadbackFuture<T> {
    pub fn with_decoder(source: Box<dyn ReadbackSource>, decode: impl FnOnce(Vec<u8>) -> Result<T> + Send + 'static) -> Self {
        Self {
            source: Some(source),
            decode: Some(Box::new(decode)),
            polls: 0,
        }
    }

    /// A future that fails on first poll.
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_decoder(Box::new(Failed(Some(message))), |_| {
            Err(TrellisError::Readback("unreachable".to_owned()))
        })
    }

    /// Times the fence has been checked.
    #[must_use]
    pub fn polls(&self) -> u32 {
        self.polls
    }
}

impl<T> Future for ReadbackFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(Err(TrellisError::Readback("polled after completion".to_owned())));
        };
        this.polls += 1;

        match source.poll() {
            ReadbackStatus::Pending => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            ReadbackStatus::Ready(bytes) => {
                this.source = None;
                match this.decode.take() {
                    Some(decode) => Poll::Ready(decode(bytes)),
                    None => Poll::Ready(Err(TrellisError::Readback("decoder already used".to_owned()))),
                }
            }
            ReadbackStatus::Failed(message) => {
                this.source = None;
                log::warn!("Readback failed: {message}");
                Poll::Ready(Err(TrellisError::Readback(message)))
            }
        }
    }
}

impl<T> fmt::Debug for ReadbackFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadbackFuture")
            .field("done", &self.source.is_none())
            .field("polls", &self.polls)
            .finish()
    }
}

struct Failed(Option<String>);

impl ReadbackSource for Failed {
    fn poll(&mut self) -> ReadbackStatus {
        ReadbackStatus::Failed(self.0.take().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::task::noop_waker_ref;

    struct Countdown {
        left: u32,
    }

    impl ReadbackSource for Countdown {
        fn poll(&mut self) -> ReadbackStatus {
            if self.left == 0 {
                ReadbackStatus::Ready(vec![1, 2, 3, 4])
            } else {
                self.left -= 1;
                ReadbackStatus::Pending
            }
        }
    }

    #[test]
    fn test_pending_fence_reschedules() {
        let mut future = ReadbackFuture::new(Box::new(Countdown { left: 2 }));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(Ok(bytes)) => assert_eq!(bytes, vec![1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(future.polls(), 3);
    }

    #[test]
    fn test_decoder_runs_once_ready() {
        let future = ReadbackFuture::with_decoder(Box::new(Countdown { left: 3 }), |bytes| Ok(bytes.len()));
        assert_eq!(block_on(future).unwrap(), 4);
    }

    #[test]
    fn test_failure_surfaces_as_error() {
        let future = ReadbackFuture::<Vec<u8>>::failed("no attachment");
        let err = block_on(future).unwrap_err();
        assert!(matches!(err, TrellisError::Readback(m) if m == "no attachment"));
    }
}
