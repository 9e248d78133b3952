use super::error::StreamError;
use crate::platform::Shared;
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

type Outcome = Result<(), StreamError>;

struct SettlementInner {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
    handled: bool,
}

/// One-shot completion signal with broadcast observers.
///
/// A settlement starts pending and is resolved or rejected exactly once;
/// later calls are ignored. Observers are woken in registration order.
/// A rejection that is never observed is reported at debug level when the
/// last handle drops, unless `mark_handled` was called.
pub struct Settlement {
    inner: Shared<Mutex<SettlementInner>>,
}

impl Settlement {
    pub fn new() -> Self {
        Self {
            inner: Shared::new(Mutex::new(SettlementInner {
                outcome: None,
                wakers: Vec::new(),
                handled: false,
            })),
        }
    }

    pub fn resolved() -> Self {
        let settlement = Self::new();
        settlement.resolve();
        settlement
    }

    pub fn rejected(error: StreamError) -> Self {
        let settlement = Self::new();
        settlement.reject(error);
        settlement
    }

    /// First call wins; later resolutions and rejections are ignored.
    pub fn resolve(&self) {
        self.settle(Ok(()));
    }

    pub fn reject(&self, error: StreamError) {
        self.settle(Err(error));
    }

    fn settle(&self, outcome: Outcome) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(outcome);
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Suppress the unobserved-rejection report for this settlement.
    pub fn mark_handled(&self) {
        self.inner.lock().handled = true;
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Outcome> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.outcome.clone() {
            inner.handled = true;
            return Poll::Ready(outcome);
        }
        let waker = cx.waker();
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
        Poll::Pending
    }

    /// A future observing this settlement. The future owns its own handle,
    /// so it is `'static` and may outlive the settlement it was taken from.
    pub fn wait(&self) -> SettlementFuture {
        SettlementFuture {
            settlement: self.clone(),
        }
    }
}

impl Default for Settlement {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Settlement {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        let state = match &inner.outcome {
            None => "pending",
            Some(Ok(())) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Settlement").field("state", &state).finish()
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if Shared::strong_count(&self.inner) != 1 {
            return;
        }
        let inner = self.inner.lock();
        if !inner.handled {
            if let Some(Err(error)) = &inner.outcome {
                tracing::debug!(%error, "settlement rejection was never observed");
            }
        }
    }
}

/// Future returned by [`Settlement::wait`].
pub struct SettlementFuture {
    settlement: Settlement,
}

impl Future for SettlementFuture {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.settlement.poll_wait(cx)
    }
}

/// Single-observer completion carrying a value, used for per-request
/// acknowledgements that transfer ownership (read results, write receipts,
/// cancel/close acknowledgements).
///
/// The sender half living inside a stream's state machine settles it; a
/// dropped sender surfaces as [`StreamError::TaskDropped`].
pub struct Completion<T = ()> {
    rx: futures::channel::oneshot::Receiver<Result<T, StreamError>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> (
        futures::channel::oneshot::Sender<Result<T, StreamError>>,
        Self,
    ) {
        let (tx, rx) = futures::channel::oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already settled.
    pub(crate) fn settled(result: Result<T, StreamError>) -> Self {
        let (tx, completion) = Self::new();
        let _ = tx.send(result);
        completion
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StreamError::TaskDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wakers registered while some condition holds, woken together when it
/// changes.
#[derive(Default)]
pub(crate) struct WakerSet {
    wakers: Vec<Waker>,
}

impl WakerSet {
    pub fn new() -> Self {
        Self { wakers: Vec::new() }
    }

    pub fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Resettable settlement slot for the writer `ready` signal and the
/// transform backpressure-change signal.
///
/// Holding a cell rather than a bare settlement lets the owner swap in a
/// fresh pending settlement whenever the condition re-arms; observers must
/// re-read the current settlement before each wait.
pub(crate) struct SettlementCell {
    current: Settlement,
}

impl SettlementCell {
    pub fn pending() -> Self {
        Self {
            current: Settlement::new(),
        }
    }

    pub fn resolved() -> Self {
        Self {
            current: Settlement::resolved(),
        }
    }

    /// Snapshot of the current settlement.
    pub fn current(&self) -> Settlement {
        self.current.clone()
    }

    /// Replace the current settlement with a fresh pending one.
    pub fn reset(&mut self) {
        self.current = Settlement::new();
    }

    pub fn resolve(&self) {
        self.current.resolve();
    }

    /// Reject the current settlement, or replace an already-settled one with
    /// a rejected settlement so later observers see the rejection.
    pub fn reject(&mut self, error: StreamError) {
        if self.current.is_settled() {
            let rejected = Settlement::rejected(error);
            rejected.mark_handled();
            self.current = rejected;
        } else {
            self.current.reject(error);
            self.current.mark_handled();
        }
    }
}
