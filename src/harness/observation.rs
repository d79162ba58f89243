use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// Value registered as the holding of an observed target.
///
/// Resolving consumes the holding, so an observation can complete at most once.
#[derive(Debug)]
pub struct Holding(oneshot::Sender<()>);

impl Holding {
    pub fn resolve(self) {
        // The observer may already have given up.
        let _ = self.0.send(());
    }
}

/// Pending result of one observation; resolves to `true` once its holding has
/// been resolved.
///
/// If the holding is dropped without being resolved the observation stays
/// pending forever and only cancellation can finish the race.
#[derive(Debug)]
pub struct Observation {
    receiver: oneshot::Receiver<()>,
    abandoned: bool,
}

impl Observation {
    pub fn new() -> (Observation, Holding) {
        let (sender, receiver) = oneshot::channel();
        (
            Observation {
                receiver,
                abandoned: false,
            },
            Holding(sender),
        )
    }
}

impl Future for Observation {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        if self.abandoned {
            return Poll::Pending;
        }
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(true),
            Poll::Ready(Err(_)) => {
                self.abandoned = true;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
