use futures_util::future::{FutureExt, LocalBoxFuture, Shared};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{sleep_until, Instant};

/// Cancellation signal for an observation. Resolves to `false`, the verdict of
/// an observation that gave up.
///
/// Clones share the same underlying signal, so one canceller can bound several
/// observations.
#[derive(Clone)]
pub struct Canceller(Shared<LocalBoxFuture<'static, bool>>);

impl Canceller {
    pub fn from_future(signal: impl Future<Output = ()> + 'static) -> Self {
        Self(
            async move {
                signal.await;
                false
            }
            .boxed_local()
            .shared(),
        )
    }
}

impl Future for Canceller {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Canceller(..)")
    }
}

/// Returns a canceller that fires `timeout_ms` milliseconds after this call.
pub fn timeout_canceller(timeout_ms: u64) -> Canceller {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    Canceller::from_future(async move { sleep_until(deadline).await })
}
