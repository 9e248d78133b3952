use super::super::{CountQueuingStrategy, QueuingStrategy, Unlocked};
use super::{
    error::StreamError,
    readable::{ReadableSource, ReadableStream, ReadableStreamDefaultController},
    settlement::{Settlement, SettlementCell},
    writable::{WritableSink, WritableState, WritableStream, WritableStreamDefaultController},
};
use crate::platform::{BoxFuture, CondSend, DynStrategy, Shared};
use futures::future;
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

type StreamResult<T> = Result<T, StreamError>;

// ----------- Transformer trait -----------

pub trait Transformer<I: CondSend + 'static, O: CondSend + 'static>: CondSend + 'static {
    /// Called once when the transform stream is created. Both inner sides
    /// wait on its settlement before doing any work.
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<I, O>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side.
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<I, O>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend;

    /// Called when the writable side is closed, before the readable side
    /// closes.
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<I, O>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = controller;
        future::ready(Ok(()))
    }
}

/// Object-safe adapter over [`Transformer`] so the transform stream is not
/// generic over the transformer type.
trait DynTransformer<I: CondSend + 'static, O: CondSend + 'static>: CondSend {
    fn start<'a>(
        &'a mut self,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>>;

    fn transform<'a>(
        &'a mut self,
        chunk: I,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>>;

    fn flush<'a>(
        &'a mut self,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>>;
}

#[cfg(feature = "send")]
type BoxedTransformer<I, O> = Box<dyn DynTransformer<I, O> + Send>;
#[cfg(feature = "local")]
type BoxedTransformer<I, O> = Box<dyn DynTransformer<I, O>>;

impl<I, O, T> DynTransformer<I, O> for T
where
    I: CondSend + 'static,
    O: CondSend + 'static,
    T: Transformer<I, O>,
{
    fn start<'a>(
        &'a mut self,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>> {
        Box::pin(Transformer::start(self, controller))
    }

    fn transform<'a>(
        &'a mut self,
        chunk: I,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>> {
        Box::pin(Transformer::transform(self, chunk, controller))
    }

    fn flush<'a>(
        &'a mut self,
        controller: &'a mut TransformStreamDefaultController<I, O>,
    ) -> BoxFuture<'a, StreamResult<()>> {
        Box::pin(Transformer::flush(self, controller))
    }
}

// ----------- Shared state -----------

struct TransformState<I: CondSend + 'static, O: CondSend + 'static> {
    backpressure: bool,
    backpressure_change: SettlementCell,
    start_settlement: Settlement,
    readable_controller: Option<ReadableStreamDefaultController<O>>,
    writable_shared: Option<Shared<Mutex<WritableState<I>>>>,
}

/// Flip the backpressure flag, resolving the current change settlement and
/// installing a fresh pending one.
fn set_backpressure<I: CondSend + 'static, O: CondSend + 'static>(
    st: &mut TransformState<I, O>,
    value: bool,
) {
    if st.backpressure == value {
        return;
    }
    st.backpressure_change.resolve();
    st.backpressure_change.reset();
    st.backpressure = value;
}

/// Error the writable side (unless past writable) and unblock a write
/// parked on backpressure.
fn error_writable_and_unblock<I: CondSend + 'static, O: CondSend + 'static>(
    shared: &Shared<Mutex<TransformState<I, O>>>,
    error: StreamError,
) {
    let writable = shared.lock().writable_shared.clone();
    if let Some(writable) = writable {
        writable.lock().error_if_needed(error);
    }
    let mut st = shared.lock();
    if st.backpressure {
        set_backpressure(&mut st, false);
    }
}

/// Error both sides of the transform.
fn transform_error<I: CondSend + 'static, O: CondSend + 'static>(
    shared: &Shared<Mutex<TransformState<I, O>>>,
    error: StreamError,
) {
    debug!(%error, "transform stream errored");
    let readable = shared.lock().readable_controller.clone();
    if let Some(controller) = readable {
        controller.error(error.clone());
    }
    error_writable_and_unblock(shared, error);
}

/// Resolves once the writable side starts erroring. Used to unpark a write
/// waiting on the backpressure-change settlement when the stream aborts.
struct ErroringWatch<I: CondSend + 'static> {
    shared: Shared<Mutex<WritableState<I>>>,
}

impl<I: CondSend + 'static> Future for ErroringWatch<I> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.shared.lock();
        if st.is_erroring_or_errored() {
            Poll::Ready(())
        } else {
            st.register_state_watcher(cx.waker());
            Poll::Pending
        }
    }
}

// ----------- Controller -----------

/// Handle passed to transformer callbacks: enqueue to the readable side,
/// error both sides, or terminate.
pub struct TransformStreamDefaultController<I: CondSend + 'static, O: CondSend + 'static> {
    shared: Shared<Mutex<TransformState<I, O>>>,
}

impl<I: CondSend + 'static, O: CondSend + 'static> Clone
    for TransformStreamDefaultController<I, O>
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<I: CondSend + 'static, O: CondSend + 'static> TransformStreamDefaultController<I, O> {
    /// Desired size of the readable side's queue.
    pub fn desired_size(&self) -> Option<isize> {
        let readable = self.shared.lock().readable_controller.clone();
        readable.and_then(|controller| controller.desired_size())
    }

    /// Enqueue a chunk on the readable side, re-engaging transform
    /// backpressure if that fills it to the high-water mark.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let readable = self.shared.lock().readable_controller.clone();
        let Some(controller) = readable else {
            return Err(StreamError::type_error("Transform controller detached"));
        };
        if !controller.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "Readable side cannot accept chunks",
            ));
        }
        if let Err(e) = controller.enqueue(chunk) {
            error_writable_and_unblock(&self.shared, e.clone());
            return Err(controller.errored_stored_error().unwrap_or(e));
        }
        let has_backpressure = controller.desired_size().map_or(true, |d| d <= 0);
        let mut st = self.shared.lock();
        if has_backpressure && !st.backpressure {
            set_backpressure(&mut st, true);
        }
        Ok(())
    }

    /// Error both sides of the transform.
    pub fn error(&self, error: StreamError) {
        transform_error(&self.shared, error);
    }

    /// Close the readable side and error the writable side, unblocking any
    /// parked write.
    pub fn terminate(&self) {
        trace!("transform stream terminated");
        let readable = self.shared.lock().readable_controller.clone();
        if let Some(controller) = readable {
            if controller.can_close_or_enqueue() {
                let _ = controller.close();
            }
        }
        let error = StreamError::type_error("Transform stream terminated");
        error_writable_and_unblock(&self.shared, error);
    }
}

// ----------- Inner sink and source -----------

/// Sink for the transform's writable side: owns the transformer and runs it
/// against each chunk, honoring the readable side's backpressure.
pub struct TransformSink<I: CondSend + 'static, O: CondSend + 'static> {
    transformer: BoxedTransformer<I, O>,
    shared: Shared<Mutex<TransformState<I, O>>>,
}

impl<I: CondSend + 'static, O: CondSend + 'static> TransformSink<I, O> {
    async fn perform_transform(&mut self, chunk: I) -> StreamResult<()> {
        let mut controller = TransformStreamDefaultController {
            shared: self.shared.clone(),
        };
        let result = self.transformer.transform(chunk, &mut controller).await;
        if let Err(e) = result {
            transform_error(&self.shared, e.clone());
            return Err(e);
        }
        Ok(())
    }
}

impl<I, O> WritableSink<I> for TransformSink<I, O>
where
    I: CondSend + 'static,
    O: CondSend + 'static,
{
    async fn start(
        &mut self,
        _controller: &mut WritableStreamDefaultController<I>,
    ) -> StreamResult<()> {
        let mut controller = TransformStreamDefaultController {
            shared: self.shared.clone(),
        };
        let result = self.transformer.start(&mut controller).await;
        let start = self.shared.lock().start_settlement.clone();
        match &result {
            Ok(()) => start.resolve(),
            Err(e) => {
                start.reject(e.clone());
                start.mark_handled();
            }
        }
        result
    }

    async fn write(
        &mut self,
        chunk: I,
        _controller: &mut WritableStreamDefaultController<I>,
    ) -> StreamResult<()> {
        let parked = {
            let st = self.shared.lock();
            if st.backpressure {
                Some(st.backpressure_change.current())
            } else {
                None
            }
        };
        if let Some(change) = parked {
            let writable = self.shared.lock().writable_shared.clone();
            match writable {
                Some(writable) => {
                    let erroring = ErroringWatch {
                        shared: writable.clone(),
                    };
                    future::select(change.wait(), erroring).await;
                    // An abort while parked rejects the write with the
                    // writable side's stored error.
                    if let Some(error) = writable.lock().erroring_stored_error() {
                        return Err(error);
                    }
                }
                None => {
                    let _ = change.wait().await;
                }
            }
        }
        self.perform_transform(chunk).await
    }

    async fn close(mut self) -> StreamResult<()> {
        let mut controller = TransformStreamDefaultController {
            shared: self.shared.clone(),
        };
        let result = self.transformer.flush(&mut controller).await;
        let readable = self.shared.lock().readable_controller.clone();
        match result {
            Ok(()) => {
                if let Some(controller) = readable {
                    if let Some(stored) = controller.errored_stored_error() {
                        return Err(stored);
                    }
                    if controller.can_close_or_enqueue() {
                        let _ = controller.close();
                    }
                }
                Ok(())
            }
            Err(e) => {
                transform_error(&self.shared, e.clone());
                // Surface the readable side's stored error; when the
                // readable errored earlier with a different value, that
                // earlier error wins over the flush rejection.
                let stored = readable
                    .and_then(|controller| controller.errored_stored_error())
                    .unwrap_or(e);
                Err(stored)
            }
        }
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let error = reason.unwrap_or(StreamError::Aborted(None));
        transform_error(&self.shared, error);
        Ok(())
    }
}

/// Source for the transform's readable side: a pull clears backpressure so
/// a parked write proceeds; a cancel errors the writable side.
pub struct TransformSource<I: CondSend + 'static, O: CondSend + 'static> {
    shared: Shared<Mutex<TransformState<I, O>>>,
}

impl<I, O> ReadableSource<O> for TransformSource<I, O>
where
    I: CondSend + 'static,
    O: CondSend + 'static,
{
    async fn start(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> StreamResult<()> {
        let start = self.shared.lock().start_settlement.clone();
        start.wait().await
    }

    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> StreamResult<()> {
        let mut st = self.shared.lock();
        if st.backpressure {
            set_backpressure(&mut st, false);
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let error = reason.unwrap_or(StreamError::Canceled);
        error_writable_and_unblock(&self.shared, error);
        Ok(())
    }
}

// ----------- TransformStream -----------

/// A writable end coupled to a readable end through a user transform.
pub struct TransformStream<I: CondSend + 'static, O: CondSend + 'static> {
    readable: ReadableStream<O, TransformSource<I, O>, Unlocked>,
    writable: WritableStream<I, TransformSink<I, O>, Unlocked>,
}

impl<I: CondSend + 'static, O: CondSend + 'static> TransformStream<I, O> {
    pub fn builder<T>(transformer: T) -> TransformStreamBuilder<I, O>
    where
        T: Transformer<I, O>,
    {
        TransformStreamBuilder {
            transformer: Box::new(transformer),
            writable_strategy: Box::new(CountQueuingStrategy::new(1)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0)),
        }
    }

    /// Split into the readable and writable sides.
    pub fn split(
        self,
    ) -> (
        ReadableStream<O, TransformSource<I, O>, Unlocked>,
        WritableStream<I, TransformSink<I, O>, Unlocked>,
    ) {
        (self.readable, self.writable)
    }
}

pub struct TransformStreamBuilder<I: CondSend + 'static, O: CondSend + 'static> {
    transformer: BoxedTransformer<I, O>,
    writable_strategy: DynStrategy<I>,
    readable_strategy: DynStrategy<O>,
}

impl<I, O> TransformStreamBuilder<I, O>
where
    I: CondSend + 'static,
    O: CondSend + 'static,
{
    pub fn writable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<I> + CondSend + 'static,
    {
        self.writable_strategy = Box::new(strategy);
        self
    }

    pub fn readable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<O> + CondSend + 'static,
    {
        self.readable_strategy = Box::new(strategy);
        self
    }

    /// Return the stream and its joined driver future without spawning it.
    pub fn prepare(self) -> (TransformStream<I, O>, BoxFuture<'static, ()>) {
        let shared = Shared::new(Mutex::new(TransformState {
            backpressure: true,
            backpressure_change: SettlementCell::pending(),
            start_settlement: Settlement::new(),
            readable_controller: None,
            writable_shared: None,
        }));
        let sink = TransformSink {
            transformer: self.transformer,
            shared: shared.clone(),
        };
        let (writable, writable_fut) = WritableStream::new_inner(sink, self.writable_strategy);
        let source = TransformSource {
            shared: shared.clone(),
        };
        let (readable, readable_fut) = ReadableStream::new_inner(source, self.readable_strategy);
        {
            let mut st = shared.lock();
            st.readable_controller = Some(readable.controller());
            st.writable_shared = Some(writable.shared.clone());
        }
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            futures::join!(writable_fut, readable_fut);
        });
        (TransformStream { readable, writable }, fut)
    }

    /// Build the stream, handing the joined driver future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

/// A transformer that passes chunks through unchanged.
pub struct IdentityTransformer<T> {
    _marker: PhantomData<T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CondSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T, T>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        future::ready(controller.enqueue(chunk))
    }
}
