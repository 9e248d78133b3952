use super::super::{Locked, Unlocked};
use super::{
    byte_source_trait::ReadableByteSource,
    error::StreamError,
    readable::StreamState,
    settlement::{Completion, Settlement, SettlementFuture, WakerSet},
};
use crate::platform::{BoxFuture, Shared};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::poll_fn,
    StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    io::{Error as IoError, ErrorKind, Result as IoResult},
    marker::PhantomData,
    num::NonZeroUsize,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::trace;

type StreamResult<T> = Result<T, StreamError>;

enum ByteJob {
    Pull,
    Cancel {
        reason: Option<StreamError>,
        ack: oneshot::Sender<StreamResult<()>>,
    },
}

/// Byte-stream state: a flat byte buffer instead of a chunk queue, read
/// directly into caller-owned buffers. View splicing is out of scope; reads
/// copy out of the front of the buffer.
struct ByteState {
    buffer: VecDeque<u8>,
    high_water_mark: usize,
    auto_allocate_chunk_size: Option<NonZeroUsize>,
    state: StreamState,
    stored_error: Option<StreamError>,
    locked: bool,
    disturbed: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    reader_waiting: bool,
    read_wakers: WakerSet,
    closed_settlement: Settlement,
    jobs: Option<UnboundedSender<ByteJob>>,
}

impl ByteState {
    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    fn desired_size(&self) -> isize {
        self.high_water_mark as isize - self.buffer.len() as isize
    }

    fn send_job(&mut self, job: ByteJob) {
        if let Some(tx) = &self.jobs {
            let _ = tx.unbounded_send(job);
        }
    }

    fn should_pull(&self) -> bool {
        if self.state != StreamState::Readable || !self.started {
            return false;
        }
        self.reader_waiting || self.desired_size() > 0
    }

    fn pull_if_needed(&mut self) {
        if !self.should_pull() {
            return;
        }
        if self.pulling {
            self.pull_again = true;
            return;
        }
        self.pulling = true;
        self.send_job(ByteJob::Pull);
    }

    fn finish_close(&mut self) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Closed;
        trace!("byte stream closed");
        self.closed_settlement.resolve();
        self.read_wakers.wake_all();
    }

    fn error_stream(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        self.buffer.clear();
        self.stored_error = Some(error.clone());
        self.state = StreamState::Errored;
        self.closed_settlement.reject(error);
        self.closed_settlement.mark_handled();
        self.read_wakers.wake_all();
        self.jobs = None;
    }
}

// ----------- Controller -----------

/// Producer-side handle for byte sources. Sizing is fixed to byte length.
pub struct ReadableByteStreamController {
    shared: Shared<Mutex<ByteState>>,
}

impl Clone for ReadableByteStreamController {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl ReadableByteStreamController {
    pub fn desired_size(&self) -> Option<isize> {
        let st = self.shared.lock();
        match st.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0),
            StreamState::Readable => Some(st.desired_size()),
        }
    }

    /// The configured auto-allocation chunk size, if any.
    pub fn auto_allocate_chunk_size(&self) -> Option<NonZeroUsize> {
        self.shared.lock().auto_allocate_chunk_size
    }

    pub fn enqueue(&self, data: &[u8]) -> StreamResult<()> {
        let mut st = self.shared.lock();
        match st.state {
            StreamState::Errored => return Err(st.stored_error()),
            StreamState::Closed => return Err(StreamError::Closed),
            StreamState::Readable => {}
        }
        if !data.is_empty() {
            st.buffer.extend(data.iter().copied());
            st.read_wakers.wake_all();
        }
        st.pull_if_needed();
        Ok(())
    }

    /// Close the stream. Buffered bytes remain readable; readers then see
    /// end of stream.
    pub fn close(&self) -> StreamResult<()> {
        let mut st = self.shared.lock();
        match st.state {
            StreamState::Errored => return Err(st.stored_error()),
            StreamState::Closed => return Err(StreamError::Closed),
            StreamState::Readable => {}
        }
        st.finish_close();
        st.jobs = None;
        Ok(())
    }

    pub fn error(&self, error: StreamError) {
        self.shared.lock().error_stream(error);
    }
}

// ----------- Stream -----------

pub struct ReadableByteStream<Source, LockState = Unlocked> {
    shared: Shared<Mutex<ByteState>>,
    _marker: PhantomData<fn() -> (Source, LockState)>,
}

impl<Source, LockState> ReadableByteStream<Source, LockState> {
    pub fn locked(&self) -> bool {
        self.shared.lock().locked
    }

    pub fn disturbed(&self) -> bool {
        self.shared.lock().disturbed
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }
}

impl<Source> ReadableByteStream<Source, Unlocked>
where
    Source: ReadableByteSource,
{
    pub fn builder(source: Source) -> ReadableByteStreamBuilder<Source> {
        ReadableByteStreamBuilder {
            source,
            high_water_mark: 0,
            auto_allocate_chunk_size: None,
        }
    }

    /// Acquire the single bring-your-own-buffer reader.
    pub fn get_byob_reader(
        &self,
    ) -> Result<
        (
            ReadableByteStream<Source, Locked>,
            ReadableStreamBYOBReader<Source>,
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

        let locked = ReadableByteStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        };
        let reader = ReadableStreamBYOBReader {
            shared: self.shared.clone(),
            released: false,
            _marker: PhantomData,
        };
        Ok((locked, reader))
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        if self.locked() {
            return Completion::settled(Err(StreamError::type_error(
                "Cannot cancel a locked stream",
            )));
        }
        cancel_byte_inner(&self.shared, reason)
    }
}

fn cancel_byte_inner(
    shared: &Shared<Mutex<ByteState>>,
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
            st.finish_close();
            st.buffer.clear();
            st.send_job(ByteJob::Cancel { reason, ack: tx });
            st.jobs = None;
        }
    }
    completion
}

fn release_byob_reader(shared: &Shared<Mutex<ByteState>>) {
    let mut st = shared.lock();
    if st.state == StreamState::Readable {
        let released = StreamError::type_error("Reader has been released");
        st.closed_settlement.reject(released);
        st.closed_settlement.mark_handled();
        st.closed_settlement = Settlement::new();
    }
    st.read_wakers.wake_all();
    st.locked = false;
}

// ----------- Builder -----------

pub struct ReadableByteStreamBuilder<Source> {
    source: Source,
    high_water_mark: usize,
    auto_allocate_chunk_size: Option<NonZeroUsize>,
}

impl<Source> ReadableByteStreamBuilder<Source>
where
    Source: ReadableByteSource,
{
    /// Byte count above which the source stops being pulled proactively.
    /// Defaults to zero: pulls happen only to satisfy waiting readers.
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn auto_allocate_chunk_size(mut self, size: NonZeroUsize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }

    pub fn prepare(
        self,
    ) -> (
        ReadableByteStream<Source, Unlocked>,
        BoxFuture<'static, ()>,
    ) {
        let (jobs_tx, jobs_rx) = unbounded();
        let shared = Shared::new(Mutex::new(ByteState {
            buffer: VecDeque::new(),
            high_water_mark: self.high_water_mark,
            auto_allocate_chunk_size: self.auto_allocate_chunk_size,
            state: StreamState::Readable,
            stored_error: None,
            locked: false,
            disturbed: false,
            started: false,
            pulling: false,
            pull_again: false,
            reader_waiting: false,
            read_wakers: WakerSet::new(),
            closed_settlement: Settlement::new(),
            jobs: Some(jobs_tx),
        }));
        let fut = byte_driver(self.source, shared.clone(), jobs_rx);
        (
            ReadableByteStream {
                shared,
                _marker: PhantomData,
            },
            Box::pin(fut),
        )
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableByteStream<Source, Unlocked>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

// ----------- BYOB reader -----------

pub struct ReadableStreamBYOBReader<Source> {
    shared: Shared<Mutex<ByteState>>,
    released: bool,
    _marker: PhantomData<fn() -> Source>,
}

impl<Source> ReadableStreamBYOBReader<Source>
where
    Source: ReadableByteSource,
{
    /// Read into the caller's buffer, returning the number of bytes copied.
    /// Zero means end of stream (or an empty buffer was supplied).
    pub async fn read(&self, buf: &mut [u8]) -> StreamResult<usize> {
        poll_fn(|cx| self.poll_read_into(cx, buf)).await
    }

    fn poll_read_into(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<StreamResult<usize>> {
        let mut st = self.shared.lock();
        st.disturbed = true;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if st.state == StreamState::Errored {
            return Poll::Ready(Err(st.stored_error()));
        }

        if !st.buffer.is_empty() {
            let wanted = buf.len().min(st.buffer.len());
            let (front, back) = st.buffer.as_slices();
            let mut copied = front.len().min(wanted);
            buf[..copied].copy_from_slice(&front[..copied]);
            if copied < wanted {
                let from_back = (wanted - copied).min(back.len());
                buf[copied..copied + from_back].copy_from_slice(&back[..from_back]);
                copied += from_back;
            }
            st.buffer.drain(..copied);
            st.reader_waiting = false;
            st.pull_if_needed();
            return Poll::Ready(Ok(copied));
        }

        if st.state == StreamState::Closed {
            return Poll::Ready(Ok(0));
        }

        st.reader_waiting = true;
        st.read_wakers.register(cx.waker());
        st.pull_if_needed();
        Poll::Pending
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        cancel_byte_inner(&self.shared, reason)
    }

    pub fn closed(&self) -> SettlementFuture {
        self.shared.lock().closed_settlement.wait()
    }

    pub fn release_lock(mut self) -> ReadableByteStream<Source, Unlocked> {
        self.released = true;
        release_byob_reader(&self.shared);
        ReadableByteStream {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Source> Drop for ReadableStreamBYOBReader<Source> {
    fn drop(&mut self) {
        if !self.released {
            release_byob_reader(&self.shared);
        }
    }
}

impl<Source> futures::io::AsyncRead for ReadableStreamBYOBReader<Source>
where
    Source: ReadableByteSource,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        match self.get_mut().poll_read_into(cx, buf) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(IoError::new(ErrorKind::Other, e.to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Driver task -----------

async fn byte_driver<Source>(
    mut source: Source,
    shared: Shared<Mutex<ByteState>>,
    mut jobs: UnboundedReceiver<ByteJob>,
) where
    Source: ReadableByteSource,
{
    let mut controller = ReadableByteStreamController {
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
            ByteJob::Pull => {
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
            ByteJob::Cancel { reason, ack } => {
                let result = source.cancel(reason).await;
                let _ = ack.send(result);
                break;
            }
        }
    }
}
