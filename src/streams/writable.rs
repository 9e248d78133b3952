use super::super::{CountQueuingStrategy, Locked, QueuingStrategy, Unlocked};
use super::{
    error::StreamError,
    queue::SizedQueue,
    settlement::{Completion, Settlement, SettlementCell, SettlementFuture, WakerSet},
};
use crate::platform::{BoxFuture, CondSend, DynStrategy, Shared};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future, StreamExt,
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

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritableStreamState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

/// Queue entries: sized chunks, terminated by at most one close sentinel.
enum WriteEntry<T> {
    Chunk(T),
    Close,
}

enum WritableJob<T> {
    Write { chunk: T },
    Close,
    Abort { reason: Option<StreamError>, settlement: Settlement },
}

struct PendingAbort {
    settlement: Settlement,
    reason: Option<StreamError>,
    was_already_erroring: bool,
}

pub(crate) struct WritableState<T: CondSend + 'static> {
    state: WritableStreamState,
    stored_error: Option<StreamError>,
    locked: bool,
    queue: SizedQueue<WriteEntry<T>>,
    strategy: DynStrategy<T>,
    started: bool,
    backpressure: bool,
    write_requests: VecDeque<oneshot::Sender<StreamResult<()>>>,
    in_flight_write: Option<oneshot::Sender<StreamResult<()>>>,
    in_flight_write_size: usize,
    close_request: Option<oneshot::Sender<StreamResult<()>>>,
    in_flight_close: Option<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<PendingAbort>,
    ready: SettlementCell,
    closed_settlement: Settlement,
    state_watchers: WakerSet,
    jobs: Option<UnboundedSender<WritableJob<T>>>,
}

impl<T: CondSend + 'static> WritableState<T> {
    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    fn high_water_mark(&self) -> usize {
        self.strategy.high_water_mark()
    }

    fn desired_size(&self) -> isize {
        let occupied = self.queue.total_size() + self.in_flight_write_size;
        self.high_water_mark() as isize - occupied as isize
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn send_job(&mut self, job: WritableJob<T>) {
        if let Some(tx) = &self.jobs {
            let _ = tx.unbounded_send(job);
        }
    }

    fn wake_state_watchers(&mut self) {
        self.state_watchers.wake_all();
    }

    /// Recompute backpressure from queue occupancy and toggle the writer's
    /// ready settlement on a change. Callers gate on state and close status.
    fn update_backpressure(&mut self) {
        let backpressure = self.desired_size() <= 0;
        if backpressure == self.backpressure {
            return;
        }
        self.backpressure = backpressure;
        if backpressure {
            self.ready.reset();
        } else {
            self.ready.resolve();
        }
    }

    /// Process the queue head iff started, nothing is in flight, and the
    /// state permits. An erroring stream finishes erroring instead.
    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.has_operation_in_flight() {
            return;
        }
        match self.state {
            WritableStreamState::Closed | WritableStreamState::Errored => return,
            WritableStreamState::Erroring => {
                self.finish_erroring();
                return;
            }
            WritableStreamState::Writable => {}
        }
        match self.queue.peek() {
            None => {}
            Some(WriteEntry::Close) => {
                self.queue.dequeue();
                debug_assert!(self.queue.is_empty());
                self.in_flight_close = self.close_request.take();
                self.send_job(WritableJob::Close);
            }
            Some(WriteEntry::Chunk(_)) => {
                let Some((WriteEntry::Chunk(chunk), size)) = self.queue.dequeue() else {
                    return;
                };
                // The chunk stays accounted against the queue until the sink
                // settles it, so backpressure covers the in-flight write.
                self.in_flight_write_size = size;
                self.in_flight_write = self.write_requests.pop_front();
                self.send_job(WritableJob::Write { chunk });
            }
        }
    }

    /// Move to `erroring`, rejecting the writer's ready settlement. Finishes
    /// immediately when no operation is in flight against the sink.
    fn start_erroring(&mut self, reason: StreamError) {
        if self.state != WritableStreamState::Writable {
            return;
        }
        debug!(error = %reason, "writable stream erroring");
        self.stored_error = Some(reason.clone());
        self.state = WritableStreamState::Erroring;
        self.ready.reject(reason);
        self.wake_state_watchers();
        if self.started && !self.has_operation_in_flight() {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        if self.state != WritableStreamState::Erroring || self.has_operation_in_flight() {
            return;
        }
        self.state = WritableStreamState::Errored;
        self.queue.reset();
        self.in_flight_write_size = 0;
        let error = self.stored_error();
        for request in self.write_requests.drain(..) {
            let _ = request.send(Err(error.clone()));
        }
        match self.pending_abort.take() {
            None => {
                self.reject_close_and_closed();
                self.jobs = None;
            }
            Some(abort) if abort.was_already_erroring => {
                abort.settlement.reject(error);
                self.reject_close_and_closed();
                self.jobs = None;
            }
            Some(abort) => {
                self.send_job(WritableJob::Abort {
                    reason: abort.reason,
                    settlement: abort.settlement,
                });
                self.jobs = None;
            }
        }
        self.wake_state_watchers();
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        match self.state {
            WritableStreamState::Writable => self.start_erroring(error),
            WritableStreamState::Erroring => self.finish_erroring(),
            _ => {}
        }
    }

    fn reject_close_and_closed(&mut self) {
        let error = self.stored_error();
        if let Some(request) = self.close_request.take() {
            let _ = request.send(Err(error.clone()));
        }
        self.closed_settlement.reject(error);
        self.closed_settlement.mark_handled();
        self.wake_state_watchers();
    }

    pub(crate) fn is_erroring_or_errored(&self) -> bool {
        matches!(
            self.state,
            WritableStreamState::Erroring | WritableStreamState::Errored
        )
    }

    pub(crate) fn erroring_stored_error(&self) -> Option<StreamError> {
        if self.is_erroring_or_errored() {
            Some(self.stored_error())
        } else {
            None
        }
    }

    pub(crate) fn register_state_watcher(&mut self, waker: &std::task::Waker) {
        self.state_watchers.register(waker);
    }

    /// Begin erroring with `reason` unless the stream is already past
    /// `writable`.
    pub(crate) fn error_if_needed(&mut self, reason: StreamError) {
        if self.state == WritableStreamState::Writable {
            self.start_erroring(reason);
        }
    }
}

// ----------- Write request plumbing -----------

fn write_inner<T: CondSend + 'static>(
    shared: &Shared<Mutex<WritableState<T>>>,
    chunk: T,
) -> Completion<()> {
    let (tx, completion) = Completion::new();
    let mut st = shared.lock();
    let size = st.strategy.size(&chunk);
    match st.state {
        WritableStreamState::Errored => {
            let _ = tx.send(Err(st.stored_error()));
            return completion;
        }
        _ if st.close_queued_or_in_flight() => {
            let _ = tx.send(Err(StreamError::Closing));
            return completion;
        }
        WritableStreamState::Closed => {
            let _ = tx.send(Err(StreamError::Closed));
            return completion;
        }
        WritableStreamState::Erroring => {
            let _ = tx.send(Err(st.stored_error()));
            return completion;
        }
        WritableStreamState::Writable => {}
    }
    st.write_requests.push_back(tx);
    st.queue.enqueue(WriteEntry::Chunk(chunk), size);
    if !st.close_queued_or_in_flight() && st.state == WritableStreamState::Writable {
        st.update_backpressure();
    }
    st.advance_queue_if_needed();
    completion
}

fn close_inner<T: CondSend + 'static>(
    shared: &Shared<Mutex<WritableState<T>>>,
) -> Completion<()> {
    let (tx, completion) = Completion::new();
    let mut st = shared.lock();
    match st.state {
        WritableStreamState::Closed => {
            let _ = tx.send(Err(StreamError::Closed));
            return completion;
        }
        WritableStreamState::Errored | WritableStreamState::Erroring => {
            let _ = tx.send(Err(st.stored_error()));
            return completion;
        }
        WritableStreamState::Writable => {}
    }
    if st.close_queued_or_in_flight() {
        let _ = tx.send(Err(StreamError::Closing));
        return completion;
    }
    trace!("writable stream close requested");
    st.close_request = Some(tx);
    // Unpark producers waiting on ready so they observe the closure.
    if st.backpressure {
        st.ready.resolve();
    }
    st.queue.enqueue(WriteEntry::Close, 0);
    st.advance_queue_if_needed();
    completion
}

fn abort_inner<T: CondSend + 'static>(
    shared: &Shared<Mutex<WritableState<T>>>,
    reason: Option<StreamError>,
) -> SettlementFuture {
    let mut st = shared.lock();
    if matches!(
        st.state,
        WritableStreamState::Closed | WritableStreamState::Errored
    ) {
        let settled = Settlement::resolved();
        return settled.wait();
    }
    if let Some(pending) = &st.pending_abort {
        return pending.settlement.wait();
    }
    let was_already_erroring = st.state == WritableStreamState::Erroring;
    let reason = if was_already_erroring { None } else { reason };
    let settlement = Settlement::new();
    st.pending_abort = Some(PendingAbort {
        settlement: settlement.clone(),
        reason: reason.clone(),
        was_already_erroring,
    });
    if !was_already_erroring {
        let stored = reason.unwrap_or(StreamError::Aborted(None));
        st.start_erroring(stored);
    }
    settlement.wait()
}

fn release_writer<T: CondSend + 'static>(shared: &Shared<Mutex<WritableState<T>>>) {
    let mut st = shared.lock();
    let released = StreamError::type_error("Writer has been released");
    if matches!(
        st.state,
        WritableStreamState::Writable | WritableStreamState::Erroring
    ) {
        st.ready.reject(released.clone());
        st.closed_settlement.reject(released);
        st.closed_settlement.mark_handled();
        // Fresh settlements for a future writer; the machine settles these
        // from here on.
        st.closed_settlement = Settlement::new();
        st.ready = if st.state == WritableStreamState::Writable
            && st.backpressure
            && !st.close_queued_or_in_flight()
        {
            SettlementCell::pending()
        } else {
            SettlementCell::resolved()
        };
    }
    st.locked = false;
}

// ----------- Sink trait -----------

pub trait WritableSink<T: CondSend + 'static>: CondSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + CondSend {
        future::ready(Ok(()))
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Controller -----------

/// Producer-side handle given to sink callbacks.
pub struct WritableStreamDefaultController<T: CondSend + 'static> {
    shared: Shared<Mutex<WritableState<T>>>,
}

impl<T: CondSend + 'static> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: CondSend + 'static> WritableStreamDefaultController<T> {
    /// Error the stream unless it is already closing down.
    pub fn error(&self, error: StreamError) {
        self.shared.lock().error_if_needed(error);
    }
}

// ----------- Stream -----------

pub struct WritableStream<T: CondSend + 'static, Sink, S = Unlocked> {
    pub(crate) shared: Shared<Mutex<WritableState<T>>>,
    _marker: PhantomData<fn() -> (Sink, S)>,
}

impl<T: CondSend + 'static, Sink, S> WritableStream<T, Sink, S> {
    pub fn locked(&self) -> bool {
        self.shared.lock().locked
    }
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: CondSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub(crate) fn new_inner(
        sink: Sink,
        strategy: DynStrategy<T>,
    ) -> (Self, BoxFuture<'static, ()>) {
        let (jobs_tx, jobs_rx) = unbounded();
        let backpressure = strategy.high_water_mark() == 0;
        let shared = Shared::new(Mutex::new(WritableState {
            state: WritableStreamState::Writable,
            stored_error: None,
            locked: false,
            queue: SizedQueue::new(),
            strategy,
            started: false,
            backpressure,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            in_flight_write_size: 0,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            ready: if backpressure {
                SettlementCell::pending()
            } else {
                SettlementCell::resolved()
            },
            closed_settlement: Settlement::new(),
            state_watchers: WakerSet::new(),
            jobs: Some(jobs_tx),
        }));
        let fut = writable_driver(sink, shared.clone(), jobs_rx);
        (
            Self {
                shared,
                _marker: PhantomData,
            },
            Box::pin(fut),
        )
    }

    /// Acquire the single writer, locking the stream to it.
    pub fn get_writer(
        &self,
    ) -> Result<
        (
            WritableStream<T, Sink, Locked>,
            WritableStreamDefaultWriter<T, Sink>,
        ),
        StreamError,
    > {
        let mut st = self.shared.lock();
        if st.locked {
            return Err(StreamError::type_error("Stream already locked"));
        }
        st.locked = true;
        match st.state {
            WritableStreamState::Writable => {
                st.closed_settlement = Settlement::new();
                st.ready = if st.backpressure && !st.close_queued_or_in_flight() {
                    SettlementCell::pending()
                } else {
                    SettlementCell::resolved()
                };
            }
            WritableStreamState::Erroring => {
                let error = st.stored_error();
                st.ready.reject(error);
                st.closed_settlement = Settlement::new();
            }
            WritableStreamState::Errored => {
                let error = st.stored_error();
                st.ready.reject(error.clone());
                let rejected = Settlement::rejected(error);
                rejected.mark_handled();
                st.closed_settlement = rejected;
            }
            WritableStreamState::Closed => {
                st.ready = SettlementCell::resolved();
                st.closed_settlement = Settlement::resolved();
            }
        }
        drop(st);

        let locked = WritableStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        };
        let writer = WritableStreamDefaultWriter {
            shared: self.shared.clone(),
            released: false,
            close_completion: None,
            _marker: PhantomData,
        };
        Ok((locked, writer))
    }

    /// Abort the stream: pending writes are rejected and the sink's abort
    /// callback runs once erroring finishes.
    pub fn abort(&self, reason: Option<StreamError>) -> SettlementFuture {
        if self.locked() {
            let settled = Settlement::rejected(StreamError::type_error(
                "Cannot abort a locked stream",
            ));
            return settled.wait();
        }
        abort_inner(&self.shared, reason)
    }

    /// Close the stream after queued writes drain.
    pub fn close(&self) -> Completion<()> {
        if self.locked() {
            return Completion::settled(Err(StreamError::type_error(
                "Cannot close a locked stream",
            )));
        }
        close_inner(&self.shared)
    }
}

// ----------- Builder -----------

pub struct WritableStreamBuilder<T: CondSend + 'static, Sink> {
    sink: Sink,
    strategy: DynStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: CondSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + CondSend + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return the stream and its driver future without spawning it.
    pub fn prepare(self) -> (WritableStream<T, Sink, Unlocked>, BoxFuture<'static, ()>) {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Build the stream, handing the driver future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Sink, Unlocked>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

// ----------- Writer -----------

pub struct WritableStreamDefaultWriter<T: CondSend + 'static, Sink> {
    shared: Shared<Mutex<WritableState<T>>>,
    released: bool,
    close_completion: Option<Completion<()>>,
    _marker: PhantomData<fn() -> Sink>,
}

impl<T, Sink> WritableStreamDefaultWriter<T, Sink>
where
    T: CondSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    /// Queue a chunk for the sink. The chunk is enqueued synchronously; the
    /// returned completion settles when the sink has processed it.
    ///
    /// Writing without awaiting `ready()` first disables backpressure and
    /// lets the internal queue grow without bound.
    pub fn write(&self, chunk: T) -> Completion<()> {
        write_inner(&self.shared, chunk)
    }

    /// Settles when the queue is below the high-water mark. Re-read before
    /// every write: the underlying settlement is replaced each time
    /// backpressure re-engages.
    pub fn ready(&self) -> SettlementFuture {
        self.shared.lock().ready.current().wait()
    }

    /// Settles when the stream closes, or rejects with the stored error.
    pub fn closed(&self) -> SettlementFuture {
        self.shared.lock().closed_settlement.wait()
    }

    pub fn close(&self) -> Completion<()> {
        close_inner(&self.shared)
    }

    pub fn abort(&self, reason: Option<StreamError>) -> SettlementFuture {
        abort_inner(&self.shared, reason)
    }

    /// Remaining capacity before backpressure engages. `None` when the
    /// stream is erroring or errored, zero when closed.
    pub fn desired_size(&self) -> Option<isize> {
        let st = self.shared.lock();
        match st.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => None,
            WritableStreamState::Closed => Some(0),
            WritableStreamState::Writable => Some(st.desired_size()),
        }
    }

    /// Release the lock. Outstanding writes keep their completions; the
    /// writer's ready and closed settlements reject with a release error.
    pub fn release_lock(mut self) -> WritableStream<T, Sink, Unlocked> {
        self.released = true;
        release_writer(&self.shared);
        WritableStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: CondSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        if !self.released {
            release_writer(&self.shared);
        }
    }
}

impl<T, Sink> futures::Sink<T> for WritableStreamDefaultWriter<T, Sink>
where
    T: CondSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let st = this.shared.lock();
        match st.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                return Poll::Ready(Err(st.stored_error()));
            }
            WritableStreamState::Closed => return Poll::Ready(Err(StreamError::Closed)),
            WritableStreamState::Writable => {}
        }
        if st.close_queued_or_in_flight() {
            return Poll::Ready(Err(StreamError::Closing));
        }
        st.ready.current().poll_wait(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let this = self.get_mut();
        // Fire-and-forget enqueue; failures surface via poll_ready/poll_flush.
        let _completion = write_inner(&this.shared, item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let mut st = this.shared.lock();
        match st.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                Poll::Ready(Err(st.stored_error()))
            }
            _ if st.queue.is_empty() && !st.has_operation_in_flight() => Poll::Ready(Ok(())),
            _ => {
                st.register_state_watcher(cx.waker());
                Poll::Pending
            }
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        let shared = this.shared.clone();
        let completion = this
            .close_completion
            .get_or_insert_with(|| close_inner(&shared));
        match Pin::new(completion).poll(cx) {
            Poll::Ready(Ok(())) | Poll::Ready(Err(StreamError::Closed)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Driver task -----------

/// Runs the sink callbacks outside the state lock, one at a time. Jobs are
/// scheduled by the state machine; results are fed back under the lock.
async fn writable_driver<T, Sink>(
    sink: Sink,
    shared: Shared<Mutex<WritableState<T>>>,
    mut jobs: UnboundedReceiver<WritableJob<T>>,
) where
    T: CondSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    let mut controller = WritableStreamDefaultController {
        shared: shared.clone(),
    };
    let mut sink = Some(sink);

    let start_result = match sink.as_mut() {
        Some(s) => s.start(&mut controller).await,
        None => Ok(()),
    };
    {
        let mut st = shared.lock();
        st.started = true;
        match start_result {
            Ok(()) => st.advance_queue_if_needed(),
            Err(e) => st.deal_with_rejection(e),
        }
    }

    while let Some(job) = jobs.next().await {
        match job {
            WritableJob::Write { chunk } => {
                let result = match sink.as_mut() {
                    Some(s) => s.write(chunk, &mut controller).await,
                    None => Err(StreamError::from("Sink missing")),
                };
                let mut st = shared.lock();
                let request = st.in_flight_write.take();
                st.in_flight_write_size = 0;
                match result {
                    Ok(()) => {
                        if let Some(tx) = request {
                            let _ = tx.send(Ok(()));
                        }
                        if !st.close_queued_or_in_flight()
                            && st.state == WritableStreamState::Writable
                        {
                            st.update_backpressure();
                        }
                        st.wake_state_watchers();
                        st.advance_queue_if_needed();
                    }
                    Err(e) => {
                        if let Some(tx) = request {
                            let _ = tx.send(Err(e.clone()));
                        }
                        st.deal_with_rejection(e);
                    }
                }
            }
            WritableJob::Close => {
                let result = match sink.take() {
                    Some(s) => s.close().await,
                    None => Ok(()),
                };
                let mut st = shared.lock();
                let request = st.in_flight_close.take();
                match result {
                    Ok(()) => {
                        if st.state == WritableStreamState::Erroring {
                            // Close won the race against an abort: the abort
                            // settles without invoking the sink's abort.
                            st.stored_error = None;
                            if let Some(abort) = st.pending_abort.take() {
                                abort.settlement.resolve();
                            }
                        }
                        st.state = WritableStreamState::Closed;
                        trace!("writable stream closed");
                        if let Some(tx) = request {
                            let _ = tx.send(Ok(()));
                        }
                        st.closed_settlement.resolve();
                        st.jobs = None;
                        st.wake_state_watchers();
                    }
                    Err(e) => {
                        if let Some(tx) = request {
                            let _ = tx.send(Err(e.clone()));
                        }
                        if let Some(abort) = st.pending_abort.take() {
                            abort.settlement.reject(e.clone());
                        }
                        st.deal_with_rejection(e);
                    }
                }
            }
            WritableJob::Abort { reason, settlement } => {
                let result = match sink.take() {
                    Some(mut s) => s.abort(reason).await,
                    None => Ok(()),
                };
                let mut st = shared.lock();
                match result {
                    Ok(()) => settlement.resolve(),
                    Err(e) => settlement.reject(e),
                }
                st.reject_close_and_closed();
                break;
            }
        }
    }
}
