use super::super::{CountQueuingStrategy, Locked, QueuingStrategy, Unlocked};
use super::{
    error::StreamError,
    queue::SizedQueue,
    settlement::{Completion, Settlement, SettlementFuture},
    transform::{TransformSource, TransformStream},
    writable::{WritableSink, WritableStream},
};
use crate::platform::{BoxFuture, CondSend, DynStrategy, Shared};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{self, Abortable},
    select_biased, FutureExt, StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

pub use futures::future::AbortRegistration;

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source trait -----------

pub trait ReadableSource<T: CondSend + 'static>: CondSend + 'static {
    /// Called once before any pull, with the stream's controller.
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called whenever the stream wants data: there is queue capacity below
    /// the high-water mark, or a read request is waiting. At most one pull
    /// is in flight at a time. A pull that settles without enqueuing is not
    /// re-invoked until the next read or enqueue.
    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend;

    /// Called when the consumer cancels the stream. A pull still in flight
    /// delays this until it settles.
    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- State machine -----------

enum ReadableJob {
    Pull,
    Cancel {
        reason: Option<StreamError>,
        ack: oneshot::Sender<StreamResult<()>>,
    },
}

pub(crate) struct ReadableState<T: CondSend + 'static> {
    state: StreamState,
    stored_error: Option<StreamError>,
    disturbed: bool,
    locked: bool,
    queue: SizedQueue<T>,
    strategy: DynStrategy<T>,
    started: bool,
    close_requested: bool,
    pulling: bool,
    pull_again: bool,
    read_requests: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
    closed_settlement: Settlement,
    jobs: Option<UnboundedSender<ReadableJob>>,
}

impl<T: CondSend + 'static> ReadableState<T> {
    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    fn can_close_or_enqueue(&self) -> bool {
        self.state == StreamState::Readable && !self.close_requested
    }

    fn desired_size(&self) -> isize {
        self.strategy.high_water_mark() as isize - self.queue.total_size() as isize
    }

    fn send_job(&mut self, job: ReadableJob) {
        if let Some(tx) = &self.jobs {
            let _ = tx.unbounded_send(job);
        }
    }

    fn should_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        (self.locked && !self.read_requests.is_empty()) || self.desired_size() > 0
    }

    /// Schedule a pull, or flag a follow-up pull if one is in flight.
    /// Guarantees at most one pull at a time and no pull once the stream can
    /// no longer close-or-enqueue.
    fn pull_if_needed(&mut self) {
        if !self.should_pull() {
            return;
        }
        if self.pulling {
            self.pull_again = true;
            return;
        }
        self.pulling = true;
        self.send_job(ReadableJob::Pull);
    }

    fn finish_close(&mut self) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Closed;
        trace!("readable stream closed");
        for request in self.read_requests.drain(..) {
            let _ = request.send(Ok(None));
        }
        self.closed_settlement.resolve();
    }

    fn error_stream(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        debug!(%error, "readable stream errored");
        self.queue.reset();
        self.stored_error = Some(error.clone());
        self.state = StreamState::Errored;
        for request in self.read_requests.drain(..) {
            let _ = request.send(Err(error.clone()));
        }
        self.closed_settlement.reject(error);
        self.closed_settlement.mark_handled();
        self.jobs = None;
    }
}

// ----------- Controller -----------

/// Producer-side handle given to source callbacks.
pub struct ReadableStreamDefaultController<T: CondSend + 'static> {
    shared: Shared<Mutex<ReadableState<T>>>,
}

impl<T: CondSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: CondSend + 'static> ReadableStreamDefaultController<T> {
    /// Remaining capacity before the high-water mark. `None` when errored,
    /// zero when closed.
    pub fn desired_size(&self) -> Option<isize> {
        let st = self.shared.lock();
        match st.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0),
            StreamState::Readable => Some(st.desired_size()),
        }
    }

    /// Enqueue a chunk. A waiting read request is served directly without
    /// the chunk touching the queue.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        let mut st = self.shared.lock();
        if !st.can_close_or_enqueue() {
            return Err(match st.state {
                StreamState::Errored => st.stored_error(),
                StreamState::Closed => StreamError::Closed,
                StreamState::Readable => StreamError::Closing,
            });
        }
        if st.locked && !st.read_requests.is_empty() {
            if let Some(request) = st.read_requests.pop_front() {
                let _ = request.send(Ok(Some(chunk)));
            }
        } else {
            let size = st.strategy.size(&chunk);
            st.queue.enqueue(chunk, size);
        }
        st.pull_if_needed();
        Ok(())
    }

    /// Request closure. The stream transitions once the queue drains.
    pub fn close(&self) -> StreamResult<()> {
        let mut st = self.shared.lock();
        if !st.can_close_or_enqueue() {
            return Err(match st.state {
                StreamState::Errored => st.stored_error(),
                StreamState::Closed => StreamError::Closed,
                StreamState::Readable => StreamError::Closing,
            });
        }
        st.close_requested = true;
        if st.queue.is_empty() {
            st.finish_close();
            st.jobs = None;
        }
        Ok(())
    }

    /// Error the stream. Ignored when the stream already left the readable
    /// state.
    pub fn error(&self, error: StreamError) {
        self.shared.lock().error_stream(error);
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.shared.lock().can_close_or_enqueue()
    }

    pub(crate) fn errored_stored_error(&self) -> Option<StreamError> {
        let st = self.shared.lock();
        if st.state == StreamState::Errored {
            Some(st.stored_error())
        } else {
            None
        }
    }
}

// ----------- Request plumbing -----------

fn read_inner<T: CondSend + 'static>(
    shared: &Shared<Mutex<ReadableState<T>>>,
) -> Completion<Option<T>> {
    let (tx, completion) = Completion::new();
    let mut st = shared.lock();
    st.disturbed = true;
    match st.state {
        StreamState::Errored => {
            let _ = tx.send(Err(st.stored_error()));
        }
        StreamState::Closed => {
            let _ = tx.send(Ok(None));
        }
        StreamState::Readable => {
            if let Some((chunk, _)) = st.queue.dequeue() {
                if st.close_requested && st.queue.is_empty() {
                    st.finish_close();
                    st.jobs = None;
                } else {
                    st.pull_if_needed();
                }
                let _ = tx.send(Ok(Some(chunk)));
            } else {
                st.read_requests.push_back(tx);
                st.pull_if_needed();
            }
        }
    }
    completion
}

fn cancel_inner<T: CondSend + 'static>(
    shared: &Shared<Mutex<ReadableState<T>>>,
    reason: Option<StreamError>,
) -> Completion<()> {
    let (tx, completion) = Completion::new();
    let mut st = shared.lock();
    st.disturbed = true;
    match st.state {
        StreamState::Closed => {
            let _ = tx.send(Ok(()));
        }
        StreamState::Errored => {
            let _ = tx.send(Err(st.stored_error()));
        }
        StreamState::Readable => {
            trace!("readable stream canceled");
            st.finish_close();
            st.queue.reset();
            st.send_job(ReadableJob::Cancel { reason, ack: tx });
            st.jobs = None;
        }
    }
    completion
}

fn release_reader<T: CondSend + 'static>(shared: &Shared<Mutex<ReadableState<T>>>) {
    let mut st = shared.lock();
    let released = StreamError::type_error("Reader has been released");
    for request in st.read_requests.drain(..) {
        let _ = request.send(Err(released.clone()));
    }
    if st.state == StreamState::Readable {
        st.closed_settlement.reject(released);
        st.closed_settlement.mark_handled();
        st.closed_settlement = Settlement::new();
    }
    st.locked = false;
}

// ----------- Stream -----------

pub struct ReadableStream<T: CondSend + 'static, Source, LockState = Unlocked> {
    pub(crate) shared: Shared<Mutex<ReadableState<T>>>,
    _marker: PhantomData<fn() -> (Source, LockState)>,
}

impl<T: CondSend + 'static, Source, LockState> ReadableStream<T, Source, LockState> {
    pub fn locked(&self) -> bool {
        self.shared.lock().locked
    }

    /// True once the stream has served a read or been canceled.
    pub fn disturbed(&self) -> bool {
        self.shared.lock().disturbed
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController {
            shared: self.shared.clone(),
        }
    }
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: CondSend + 'static,
    Source: ReadableSource<T>,
{
    pub fn builder(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub(crate) fn new_inner(
        source: Source,
        strategy: DynStrategy<T>,
    ) -> (Self, BoxFuture<'static, ()>) {
        let (jobs_tx, jobs_rx) = unbounded();
        let shared = Shared::new(Mutex::new(ReadableState {
            state: StreamState::Readable,
            stored_error: None,
            disturbed: false,
            locked: false,
            queue: SizedQueue::new(),
            strategy,
            started: false,
            close_requested: false,
            pulling: false,
            pull_again: false,
            read_requests: VecDeque::new(),
            closed_settlement: Settlement::new(),
            jobs: Some(jobs_tx),
        }));
        let fut = readable_driver(source, shared.clone(), jobs_rx);
        (
            Self {
                shared,
                _marker: PhantomData,
            },
            Box::pin(fut),
        )
    }
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: CondSend + 'static,
    Source: CondSend + 'static,
{
    /// Acquire the single reader, locking the stream to it.
    pub fn get_reader(
        &self,
    ) -> Result<
        (
            ReadableStream<T, Source, Locked>,
            ReadableStreamDefaultReader<T, Source>,
        ),
        StreamError,
    > {
        let mut st = self.shared.lock();
        if st.locked {
            return Err(StreamError::type_error("Stream already locked"));
        }
        st.locked = true;
        st.closed_settlement = match st.state {
            StreamState::Readable => Settlement::new(),
            StreamState::Closed => Settlement::resolved(),
            StreamState::Errored => {
                let rejected = Settlement::rejected(st.stored_error());
                rejected.mark_handled();
                rejected
            }
        };
        drop(st);

        let locked = ReadableStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        };
        let reader = ReadableStreamDefaultReader {
            shared: self.shared.clone(),
            released: false,
            _marker: PhantomData,
        };
        Ok((locked, reader))
    }

    /// Cancel the stream, discarding queued chunks. The source's cancel
    /// callback runs once; its result settles the completion.
    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        if self.locked() {
            return Completion::settled(Err(StreamError::type_error(
                "Cannot cancel a locked stream",
            )));
        }
        cancel_inner(&self.shared, reason)
    }

    /// Fork the stream into two branches fed from a shared reader.
    ///
    /// Each chunk is delivered to both non-canceled branches in the same
    /// order; cloning stands in for the shared chunk reference, so wrap
    /// chunks in a shared pointer when copies are unwanted.
    pub fn tee(self) -> TeeBuilder<T, Source>
    where
        T: Clone,
    {
        TeeBuilder { stream: self }
    }

    /// Expose the stream as a `futures::Stream` of chunks.
    pub fn into_stream(self) -> Result<ReaderStream<T, Source>, StreamError> {
        let (_locked, reader) = self.get_reader()?;
        Ok(reader.into_stream(false))
    }

    /// Drain this stream into `destination`.
    ///
    /// Both endpoints are locked for the pipe's lifetime. Close, abort, and
    /// cancel propagation follow the option flags; `signal` aborts the pipe
    /// from outside. The first terminal event decides the outcome.
    pub async fn pipe_to<Sink>(
        self,
        destination: &WritableStream<T, Sink, Unlocked>,
        options: Option<StreamPipeOptions>,
    ) -> StreamResult<()>
    where
        Sink: WritableSink<T> + 'static,
    {
        let options = options.unwrap_or_default();
        let (_locked_dest, writer) = destination.get_writer()?;
        let (_locked_src, reader) = match self.get_reader() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = writer.release_lock();
                return Err(e);
            }
        };

        let mut aborted: BoxFuture<'static, ()> = match options.signal {
            Some(registration) => Box::pin(async move {
                let _ = Abortable::new(future::pending::<()>(), registration).await;
            }),
            None => Box::pin(future::pending()),
        };

        enum Shutdown {
            SignalAborted,
            SourceErrored(StreamError),
            SourceClosed,
            DestErrored(StreamError),
            DestClosed,
        }

        let shutdown = loop {
            // Destination must be ready (and alive) before the next read.
            let ready_outcome = {
                let mut ready = writer.ready().fuse();
                let mut src_closed = reader.closed().fuse();
                let mut dst_closed = writer.closed().fuse();
                select_biased! {
                    _ = (&mut aborted).fuse() => break Shutdown::SignalAborted,
                    r = dst_closed => break match r {
                        Ok(()) => Shutdown::DestClosed,
                        Err(e) => Shutdown::DestErrored(e),
                    },
                    r = src_closed => break match r {
                        Ok(()) => Shutdown::SourceClosed,
                        Err(e) => Shutdown::SourceErrored(e),
                    },
                    r = ready => r,
                }
            };
            if let Err(e) = ready_outcome {
                break Shutdown::DestErrored(e);
            }

            // Pull one chunk, still racing terminal events.
            let read_outcome = {
                let mut read = reader.read().fuse();
                let mut dst_closed = writer.closed().fuse();
                select_biased! {
                    _ = (&mut aborted).fuse() => break Shutdown::SignalAborted,
                    r = dst_closed => break match r {
                        Ok(()) => Shutdown::DestClosed,
                        Err(e) => Shutdown::DestErrored(e),
                    },
                    r = read => r,
                }
            };
            match read_outcome {
                Ok(Some(chunk)) => {
                    // Fire-and-forget: completion surfaces through the
                    // writer's ready/closed settlements.
                    let _ = writer.write(chunk);
                }
                Ok(None) => break Shutdown::SourceClosed,
                Err(e) => break Shutdown::SourceErrored(e),
            }
        };

        let result = match shutdown {
            Shutdown::SignalAborted => {
                let reason = StreamError::Aborted(Some("pipe aborted".into()));
                debug!("pipe aborted by signal");
                if !options.prevent_abort {
                    let _ = writer.abort(Some(reason.clone())).await;
                }
                if !options.prevent_cancel {
                    let _ = reader.cancel(Some(reason.clone())).await;
                }
                Err(reason)
            }
            Shutdown::SourceErrored(e) => {
                debug!(error = %e, "pipe source errored");
                if !options.prevent_abort {
                    let _ = writer.abort(Some(e.clone())).await;
                }
                Err(e)
            }
            Shutdown::SourceClosed => {
                trace!("pipe source closed");
                if options.prevent_close {
                    Ok(())
                } else {
                    writer.close().await
                }
            }
            Shutdown::DestErrored(e) => {
                debug!(error = %e, "pipe destination errored");
                if !options.prevent_cancel {
                    let _ = reader.cancel(Some(e.clone())).await;
                }
                Err(e)
            }
            Shutdown::DestClosed => {
                let error = StreamError::type_error("Destination closed during pipe");
                if !options.prevent_cancel {
                    let _ = reader.cancel(Some(error.clone())).await;
                }
                Err(error)
            }
        };

        let _ = writer.release_lock();
        let _ = reader.release_lock();
        result
    }

    /// Pipe through a transform, returning its readable side. The pipe
    /// itself runs on the future handed to `spawn_fn`.
    pub fn pipe_through<O, F, R>(
        self,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
        spawn_fn: F,
    ) -> ReadableStream<O, TransformSource<T, O>, Unlocked>
    where
        O: CondSend + 'static,
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (readable, writable) = transform.split();
        spawn_fn(Box::pin(async move {
            let _ = self.pipe_to(&writable, options).await;
        }));
        readable
    }
}

// ----------- Pipe options -----------

pub struct StreamPipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortRegistration>,
}

impl Default for StreamPipeOptions {
    fn default() -> Self {
        Self {
            prevent_close: false,
            prevent_abort: false,
            prevent_cancel: false,
            signal: None,
        }
    }
}

// ----------- Builder -----------

pub struct ReadableStreamBuilder<T: CondSend + 'static, Source> {
    source: Source,
    strategy: DynStrategy<T>,
}

impl<T, Source> ReadableStreamBuilder<T, Source>
where
    T: CondSend + 'static,
    Source: ReadableSource<T>,
{
    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + CondSend + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return the stream and its driver future without spawning it.
    pub fn prepare(self) -> (ReadableStream<T, Source, Unlocked>, BoxFuture<'static, ()>) {
        ReadableStream::new_inner(self.source, self.strategy)
    }

    /// Build the stream, handing the driver future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, Source, Unlocked>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

// ----------- Example source implementations -----------

pub struct IteratorSource<I: CondSend + 'static> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + CondSend + 'static,
    T: CondSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.iter.next() {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S: CondSend + 'static> {
    stream: S,
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    S: futures::Stream<Item = T> + Unpin + CondSend + 'static,
    T: CondSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.stream.next().await {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

impl<T, I> ReadableStream<T, IteratorSource<I>, Unlocked>
where
    T: CondSend + 'static,
    I: Iterator<Item = T> + CondSend + 'static,
{
    pub fn from_iterator(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>> {
        ReadableStream::builder(IteratorSource { iter })
    }
}

impl<T, S> ReadableStream<T, AsyncStreamSource<S>, Unlocked>
where
    T: CondSend + 'static,
    S: futures::Stream<Item = T> + Unpin + CondSend + 'static,
{
    pub fn from_stream(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>> {
        ReadableStream::builder(AsyncStreamSource { stream })
    }
}

// ----------- Default reader -----------

pub struct ReadableStreamDefaultReader<T: CondSend + 'static, Source> {
    shared: Shared<Mutex<ReadableState<T>>>,
    released: bool,
    _marker: PhantomData<fn() -> Source>,
}

impl<T, Source> ReadableStreamDefaultReader<T, Source>
where
    T: CondSend + 'static,
    Source: CondSend + 'static,
{
    /// Next chunk, or `None` once the stream closes. Requests are fulfilled
    /// in FIFO order.
    pub fn read(&self) -> Completion<Option<T>> {
        read_inner(&self.shared)
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        cancel_inner(&self.shared, reason)
    }

    /// Settles when the stream closes; rejects with the stored error or when
    /// the reader is released first.
    pub fn closed(&self) -> SettlementFuture {
        self.shared.lock().closed_settlement.wait()
    }

    /// Release the lock. Pending read requests are rejected; the stream can
    /// hand out a new reader afterwards.
    pub fn release_lock(mut self) -> ReadableStream<T, Source, Unlocked> {
        self.released = true;
        release_reader(&self.shared);
        ReadableStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }

    /// Adapt the reader into a `futures::Stream`. The sequence is fused:
    /// after the terminal item it yields `None` forever. Unless
    /// `prevent_cancel` is set, stopping early cancels the underlying
    /// stream.
    pub fn into_stream(mut self, prevent_cancel: bool) -> ReaderStream<T, Source> {
        self.released = true;
        ReaderStream {
            reader: Some(ReadableStreamDefaultReader {
                shared: self.shared.clone(),
                released: false,
                _marker: PhantomData,
            }),
            pending: None,
            prevent_cancel,
            done: false,
        }
    }
}

impl<T: CondSend + 'static, Source> Drop for ReadableStreamDefaultReader<T, Source> {
    fn drop(&mut self) {
        if !self.released {
            release_reader(&self.shared);
        }
    }
}

// ----------- Async-iterator adapter -----------

/// Lazy sequence of chunks backed by a reader. Produced by
/// [`ReadableStreamDefaultReader::into_stream`].
pub struct ReaderStream<T: CondSend + 'static, Source> {
    reader: Option<ReadableStreamDefaultReader<T, Source>>,
    pending: Option<Completion<Option<T>>>,
    prevent_cancel: bool,
    done: bool,
}

impl<T, Source> ReaderStream<T, Source>
where
    T: CondSend + 'static,
    Source: CondSend + 'static,
{
    /// Early termination: releases the reader and, unless the stream was
    /// built with `prevent_cancel`, cancels upstream with `reason`.
    pub async fn stop(mut self, reason: Option<StreamError>) -> StreamResult<()> {
        self.done = true;
        self.pending = None;
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        if self.prevent_cancel {
            drop(reader);
            return Ok(());
        }
        let completion = reader.cancel(reason);
        drop(reader);
        completion.await
    }
}

impl<T, Source> futures::Stream for ReaderStream<T, Source>
where
    T: CondSend + 'static,
    Source: CondSend + 'static,
{
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(pending) = this.pending.as_mut() {
                return match Pin::new(pending).poll(cx) {
                    Poll::Ready(Ok(Some(chunk))) => {
                        this.pending = None;
                        Poll::Ready(Some(Ok(chunk)))
                    }
                    Poll::Ready(Ok(None)) => {
                        this.pending = None;
                        this.done = true;
                        this.reader = None;
                        Poll::Ready(None)
                    }
                    Poll::Ready(Err(e)) => {
                        this.pending = None;
                        this.done = true;
                        this.reader = None;
                        Poll::Ready(Some(Err(e)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
            match &this.reader {
                Some(reader) => this.pending = Some(reader.read()),
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<T, Source> futures::stream::FusedStream for ReaderStream<T, Source>
where
    T: CondSend + 'static,
    Source: CondSend + 'static,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

// ----------- AsyncSignal -----------

/// Level-triggered wake-up flag. Signals raised while nobody waits are
/// remembered; signals raised while a read is in progress coalesce into one
/// follow-up wake.
#[derive(Clone)]
pub struct AsyncSignal {
    waker: Shared<Mutex<Option<std::task::Waker>>>,
    signaled: Shared<std::sync::atomic::AtomicBool>,
}

impl AsyncSignal {
    pub fn new() -> Self {
        Self {
            waker: Shared::new(Mutex::new(None)),
            signaled: Shared::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub async fn wait(&self) {
        future::poll_fn(|cx| {
            if self
                .signaled
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                Poll::Ready(())
            } else {
                *self.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    pub fn signal(&self) {
        self.signaled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl Default for AsyncSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ----------- Tee -----------

struct TeeShared<T: CondSend + 'static> {
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    controllers: [Option<ReadableStreamDefaultController<T>>; 2],
    cancel_settlement: Settlement,
    demand: AsyncSignal,
    both_canceled: Settlement,
}

/// Branch-side source: pulls signal demand to the tee coordinator; cancels
/// record the branch reason and gate upstream cancellation on both branches.
pub struct TeeSource<T: CondSend + 'static> {
    shared: Shared<Mutex<TeeShared<T>>>,
    index: usize,
}

impl<T> ReadableSource<T> for TeeSource<T>
where
    T: CondSend + Clone + 'static,
{
    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        let tee = self.shared.lock();
        if !tee.canceled[self.index] {
            tee.demand.signal();
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let settlement = {
            let mut tee = self.shared.lock();
            tee.canceled[self.index] = true;
            tee.reasons[self.index] = reason;
            if tee.canceled[0] && tee.canceled[1] {
                tee.both_canceled.resolve();
            }
            tee.cancel_settlement.clone()
        };
        settlement.wait().await
    }
}

/// Serialized pull loop over the shared reader. One read is in flight at a
/// time; demand raised meanwhile coalesces into a single follow-up read.
async fn tee_coordinator<T, Source>(
    reader: ReadableStreamDefaultReader<T, Source>,
    shared: Shared<Mutex<TeeShared<T>>>,
) where
    T: CondSend + Clone + 'static,
    Source: CondSend + 'static,
{
    let (demand, both_canceled) = {
        let tee = shared.lock();
        (tee.demand.clone(), tee.both_canceled.clone())
    };

    loop {
        let mut wanted = Box::pin(demand.wait()).fuse();
        let mut all_gone = both_canceled.wait().fuse();
        select_biased! {
            _ = all_gone => {
                cancel_tee_upstream(&reader, &shared).await;
                return;
            }
            _ = wanted => {}
        }

        let mut read = reader.read().fuse();
        let mut all_gone = both_canceled.wait().fuse();
        let result = select_biased! {
            _ = all_gone => {
                cancel_tee_upstream(&reader, &shared).await;
                return;
            }
            r = read => r,
        };

        let mut tee = shared.lock();
        match result {
            Ok(Some(chunk)) => {
                for index in 0..2 {
                    if tee.canceled[index] {
                        continue;
                    }
                    if let Some(controller) = &tee.controllers[index] {
                        let _ = controller.enqueue(chunk.clone());
                    }
                }
            }
            Ok(None) => {
                for index in 0..2 {
                    if tee.canceled[index] {
                        continue;
                    }
                    if let Some(controller) = &tee.controllers[index] {
                        let _ = controller.close();
                    }
                }
                tee.cancel_settlement.resolve();
                return;
            }
            Err(e) => {
                for index in 0..2 {
                    if let Some(controller) = &tee.controllers[index] {
                        controller.error(e.clone());
                    }
                }
                tee.cancel_settlement.resolve();
                return;
            }
        }
    }
}

async fn cancel_tee_upstream<T, Source>(
    reader: &ReadableStreamDefaultReader<T, Source>,
    shared: &Shared<Mutex<TeeShared<T>>>,
) where
    T: CondSend + Clone + 'static,
    Source: CondSend + 'static,
{
    let (upstream_cancel, settlement) = {
        let tee = shared.lock();
        let composite = StreamError::Composite(vec![
            tee.reasons[0].clone().unwrap_or(StreamError::Canceled),
            tee.reasons[1].clone().unwrap_or(StreamError::Canceled),
        ]);
        trace!("both tee branches canceled, canceling upstream");
        (
            reader.cancel(Some(composite)),
            tee.cancel_settlement.clone(),
        )
    };
    match upstream_cancel.await {
        Ok(()) => settlement.resolve(),
        Err(e) => settlement.reject(e),
    }
}

pub struct TeeBuilder<T: CondSend + 'static, Source> {
    stream: ReadableStream<T, Source, Unlocked>,
}

type TeeBranch<T> = ReadableStream<T, TeeSource<T>, Unlocked>;

impl<T, Source> TeeBuilder<T, Source>
where
    T: CondSend + Clone + 'static,
    Source: CondSend + 'static,
{
    /// Wire both branches, returning them with their joined driver future.
    pub fn prepare(
        self,
    ) -> Result<((TeeBranch<T>, TeeBranch<T>), BoxFuture<'static, ()>), StreamError> {
        let (_locked, reader) = self.stream.get_reader()?;
        let shared = Shared::new(Mutex::new(TeeShared {
            canceled: [false, false],
            reasons: [None, None],
            controllers: [None, None],
            cancel_settlement: Settlement::new(),
            demand: AsyncSignal::new(),
            both_canceled: Settlement::new(),
        }));
        let (branch1, fut1) = ReadableStream::new_inner(
            TeeSource {
                shared: shared.clone(),
                index: 0,
            },
            Box::new(CountQueuingStrategy::new(1)),
        );
        let (branch2, fut2) = ReadableStream::new_inner(
            TeeSource {
                shared: shared.clone(),
                index: 1,
            },
            Box::new(CountQueuingStrategy::new(1)),
        );
        {
            let mut tee = shared.lock();
            tee.controllers[0] = Some(branch1.controller());
            tee.controllers[1] = Some(branch2.controller());
        }
        let coordinator = tee_coordinator(reader, shared);
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            futures::join!(fut1, fut2, coordinator);
        });
        Ok(((branch1, branch2), fut))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> Result<(TeeBranch<T>, TeeBranch<T>), StreamError>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (branches, fut) = self.prepare()?;
        spawn_fn(fut);
        Ok(branches)
    }
}

// ----------- Driver task -----------

/// Runs the source callbacks outside the state lock, one at a time. Pull
/// results feed the pull-again discipline; a cancel acknowledges the caller
/// and ends the driver.
async fn readable_driver<T, Source>(
    mut source: Source,
    shared: Shared<Mutex<ReadableState<T>>>,
    mut jobs: UnboundedReceiver<ReadableJob>,
) where
    T: CondSend + 'static,
    Source: ReadableSource<T>,
{
    let mut controller = ReadableStreamDefaultController {
        shared: shared.clone(),
    };

    match source.start(&mut controller).await {
        Ok(()) => {
            let mut st = shared.lock();
            st.started = true;
            st.pull_if_needed();
        }
        Err(e) => {
            shared.lock().error_stream(e);
        }
    }

    while let Some(job) = jobs.next().await {
        match job {
            ReadableJob::Pull => {
                let result = source.pull(&mut controller).await;
                let mut st = shared.lock();
                st.pulling = false;
                match result {
                    Ok(()) => {
                        if st.pull_again {
                            st.pull_again = false;
                            st.pull_if_needed();
                        }
                    }
                    Err(e) => st.error_stream(e),
                }
            }
            ReadableJob::Cancel { reason, ack } => {
                let result = source.cancel(reason).await;
                let _ = ack.send(result);
                break;
            }
        }
    }
    // Dropping the source here releases the captured algorithms.
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    /// Pull never produces on its own; tests drive the controller directly.
    struct ManualSource;

    impl ReadableSource<i32> for ManualSource {
        async fn pull(
            &mut self,
            _controller: &mut ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            Ok(())
        }
    }

    struct CancelRecordingSource {
        cancels: Arc<AtomicUsize>,
        reason: Arc<parking_lot::Mutex<Option<Option<StreamError>>>>,
    }

    impl ReadableSource<i32> for CancelRecordingSource {
        async fn pull(
            &mut self,
            _controller: &mut ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            Ok(())
        }

        async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            *self.reason.lock() = Some(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_items_sequentially_from_iterator() {
        let data = vec![1, 2, 3, 4, 5];
        let stream = ReadableStream::from_iterator(data.clone().into_iter()).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        for expected in data {
            assert_eq!(reader.read().await.unwrap(), Some(expected));
        }

        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn handles_empty_stream_immediately() {
        let empty: Vec<i32> = vec![];
        let stream = ReadableStream::from_iterator(empty.into_iter()).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn enforces_stream_locking() {
        let stream = ReadableStream::from_iterator(vec![1].into_iter()).spawn(tokio::spawn);
        assert!(!stream.locked());

        let (_locked, reader) = stream.get_reader().unwrap();
        assert!(stream.locked());
        assert!(stream.get_reader().is_err());
        assert!(matches!(
            stream.cancel(None).await,
            Err(StreamError::TypeError(_))
        ));

        let unlocked = reader.release_lock();
        assert!(!unlocked.locked());
        let (_locked, _reader) = unlocked.get_reader().unwrap();
    }

    #[tokio::test]
    async fn pending_read_is_served_directly_on_enqueue() {
        let stream = ReadableStream::builder(ManualSource).spawn(tokio::spawn);
        let controller = stream.controller();
        let (_locked, reader) = stream.get_reader().unwrap();

        let pending = reader.read();
        tokio::task::yield_now().await;
        controller.enqueue(7).unwrap();

        assert_eq!(pending.await.unwrap(), Some(7));
        // Direct delivery must bypass the queue entirely.
        assert_eq!(controller.desired_size(), Some(1));
    }

    #[tokio::test]
    async fn close_drains_queue_before_reporting_done() {
        let stream = ReadableStream::builder(ManualSource)
            .strategy(CountQueuingStrategy::new(10))
            .spawn(tokio::spawn);
        let controller = stream.controller();
        let (_locked, reader) = stream.get_reader().unwrap();

        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        controller.close().unwrap();

        assert!(matches!(controller.enqueue(3), Err(StreamError::Closing)));
        assert_eq!(stream.state(), StreamState::Readable);

        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(stream.state(), StreamState::Closed);
        reader.closed().await.unwrap();
        assert_eq!(controller.desired_size(), Some(0));
    }

    #[tokio::test]
    async fn error_rejects_pending_and_future_reads() {
        let stream = ReadableStream::builder(ManualSource).spawn(tokio::spawn);
        let controller = stream.controller();
        let (_locked, reader) = stream.get_reader().unwrap();

        let pending = reader.read();
        tokio::task::yield_now().await;
        controller.error(StreamError::from("boom"));

        assert!(pending.await.is_err());
        assert!(reader.read().await.is_err());
        assert!(reader.closed().await.is_err());
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn cancel_invokes_source_once_with_reason() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(parking_lot::Mutex::new(None));
        let source = CancelRecordingSource {
            cancels: cancels.clone(),
            reason: reason.clone(),
        };
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);

        stream
            .cancel(Some(StreamError::Aborted(Some("no longer needed".into()))))
            .await
            .unwrap();
        stream.cancel(None).await.unwrap();

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        let recorded = reason.lock().take();
        assert!(matches!(recorded, Some(Some(StreamError::Aborted(_)))));
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.disturbed());
    }

    #[tokio::test]
    async fn zero_high_water_mark_pulls_only_for_pending_reads() {
        struct CountingSource {
            pulls: Arc<AtomicUsize>,
            next: i32,
        }

        impl ReadableSource<i32> for CountingSource {
            async fn pull(
                &mut self,
                controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                self.pulls.fetch_add(1, Ordering::SeqCst);
                self.next += 1;
                controller.enqueue(self.next)?;
                Ok(())
            }
        }

        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::builder(CountingSource {
            pulls: pulls.clone(),
            next: 0,
        })
        .strategy(CountQueuingStrategy::new(0))
        .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        tokio::task::yield_now().await;
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reentrant_enqueue_from_pull_flows_through() {
        struct BurstSource {
            sent: bool,
        }

        impl ReadableSource<i32> for BurstSource {
            async fn pull(
                &mut self,
                controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                if self.sent {
                    controller.close()?;
                    return Ok(());
                }
                self.sent = true;
                controller.enqueue(1)?;
                controller.enqueue(2)?;
                controller.enqueue(3)?;
                Ok(())
            }
        }

        let stream = ReadableStream::builder(BurstSource { sent: false })
            .strategy(CountQueuingStrategy::new(2))
            .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), Some(3));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pull_failure_errors_the_stream() {
        struct FailingSource;

        impl ReadableSource<i32> for FailingSource {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                Err(StreamError::from("pull failed"))
            }
        }

        let stream = ReadableStream::builder(FailingSource).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert!(reader.read().await.is_err());
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn release_lock_rejects_pending_reads() {
        let stream = ReadableStream::builder(ManualSource).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        let pending = reader.read();
        let closed = reader.closed();
        let _unlocked = reader.release_lock();

        assert!(matches!(pending.await, Err(StreamError::TypeError(_))));
        assert!(matches!(closed.await, Err(StreamError::TypeError(_))));
    }

    #[tokio::test]
    async fn reader_stream_adapter_yields_all_chunks_then_fuses() {
        let stream = ReadableStream::from_iterator(vec![1, 2, 3].into_iter()).spawn(tokio::spawn);
        let mut chunks = stream.into_stream().unwrap();

        let mut collected = Vec::new();
        while let Some(item) = chunks.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, vec![1, 2, 3]);
        assert!(chunks.next().await.is_none());
        assert!(futures::stream::FusedStream::is_terminated(&chunks));
    }

    #[tokio::test]
    async fn reader_stream_stop_cancels_upstream() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(parking_lot::Mutex::new(None));
        let source = CancelRecordingSource {
            cancels: cancels.clone(),
            reason: reason.clone(),
        };
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        let chunks = reader.into_stream(false);

        chunks.stop(Some(StreamError::Canceled)).await.unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tee_branches_observe_same_chunks_in_order() {
        let stream = ReadableStream::from_iterator(vec![1, 2, 3].into_iter()).spawn(tokio::spawn);
        let ((branch1, branch2), fut) = stream.tee().prepare().unwrap();
        tokio::spawn(fut);

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();

        let mut seen1 = Vec::new();
        let mut seen2 = Vec::new();
        loop {
            let a = timeout(Duration::from_secs(1), reader1.read())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_secs(1), reader2.read())
                .await
                .unwrap()
                .unwrap();
            match (a, b) {
                (Some(x), Some(y)) => {
                    seen1.push(x);
                    seen2.push(y);
                }
                (None, None) => break,
                other => panic!("branches diverged: {:?}", other),
            }
        }
        assert_eq!(seen1, vec![1, 2, 3]);
        assert_eq!(seen2, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn tee_single_branch_cancel_keeps_upstream_alive() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(parking_lot::Mutex::new(None));
        let source = CancelRecordingSource {
            cancels: cancels.clone(),
            reason: reason.clone(),
        };
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);
        let controller = stream.controller();
        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        controller.close().unwrap();

        let ((branch1, branch2), fut) = stream.tee().prepare().unwrap();
        tokio::spawn(fut);

        let cancel1 = branch1.cancel(Some(StreamError::Aborted(Some("first".into()))));
        tokio::task::yield_now().await;
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        let (_l2, reader2) = branch2.get_reader().unwrap();
        assert_eq!(reader2.read().await.unwrap(), Some(1));
        assert_eq!(reader2.read().await.unwrap(), Some(2));
        assert_eq!(reader2.read().await.unwrap(), None);

        // Upstream ran to completion, so the shared cancel settles without a
        // composite upstream cancel.
        timeout(Duration::from_secs(1), cancel1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tee_both_branches_canceled_forwards_composite_reason() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(parking_lot::Mutex::new(None));
        let source = CancelRecordingSource {
            cancels: cancels.clone(),
            reason: reason.clone(),
        };
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);
        let ((branch1, branch2), fut) = stream.tee().prepare().unwrap();
        tokio::spawn(fut);

        let cancel1 = branch1.cancel(Some(StreamError::Aborted(Some("one".into()))));
        tokio::task::yield_now().await;
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        let cancel2 = branch2.cancel(Some(StreamError::Aborted(Some("two".into()))));
        timeout(Duration::from_secs(1), cancel1)
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(1), cancel2)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        let recorded = reason.lock().take().flatten();
        match recorded {
            Some(StreamError::Composite(reasons)) => {
                assert_eq!(reasons.len(), 2);
                assert!(matches!(&reasons[0], StreamError::Aborted(Some(r)) if r == "one"));
                assert!(matches!(&reasons[1], StreamError::Aborted(Some(r)) if r == "two"));
            }
            other => panic!("expected composite cancel reason, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tee_upstream_error_errors_both_branches() {
        let stream = ReadableStream::builder(ManualSource).spawn(tokio::spawn);
        let controller = stream.controller();
        let ((branch1, branch2), fut) = stream.tee().prepare().unwrap();
        tokio::spawn(fut);

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();
        let pending1 = reader1.read();
        let pending2 = reader2.read();
        tokio::task::yield_now().await;

        controller.error(StreamError::from("upstream failure"));

        assert!(timeout(Duration::from_secs(1), pending1)
            .await
            .unwrap()
            .is_err());
        assert!(timeout(Duration::from_secs(1), pending2)
            .await
            .unwrap()
            .is_err());
    }
}
