#![cfg(feature = "send")]

use futures::future::AbortHandle;
use rivulet::{
    CountQueuingStrategy, IdentityTransformer, ReadableSource, ReadableStream,
    ReadableStreamDefaultController, StreamError, StreamPipeOptions, StreamState, TransformStream,
    WritableSink, WritableStream, WritableStreamDefaultController,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type StreamResult<T> = Result<T, StreamError>;

/// Enqueues a fixed set of chunks during start, then closes.
struct UpfrontSource {
    chunks: Vec<&'static str>,
}

impl ReadableSource<&'static str> for UpfrontSource {
    async fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<&'static str>,
    ) -> StreamResult<()> {
        for chunk in self.chunks.drain(..) {
            controller.enqueue(chunk)?;
        }
        controller.close()?;
        Ok(())
    }

    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<&'static str>,
    ) -> StreamResult<()> {
        Ok(())
    }
}

struct CancelProbeSource {
    cancels: Arc<AtomicUsize>,
    reason: Arc<parking_lot::Mutex<Option<Option<StreamError>>>>,
    items: std::vec::IntoIter<i32>,
}

impl CancelProbeSource {
    fn new(
        items: Vec<i32>,
    ) -> (
        Self,
        Arc<AtomicUsize>,
        Arc<parking_lot::Mutex<Option<Option<StreamError>>>>,
    ) {
        let cancels = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(parking_lot::Mutex::new(None));
        (
            Self {
                cancels: cancels.clone(),
                reason: reason.clone(),
                items: items.into_iter(),
            },
            cancels,
            reason,
        )
    }
}

impl ReadableSource<i32> for CancelProbeSource {
    // Never closes on its own: exhaustion just leaves the stream idle, so
    // shutdown paths other than source-close stay observable.
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        if let Some(item) = self.items.next() {
            controller.enqueue(item)?;
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        *self.reason.lock() = Some(reason);
        Ok(())
    }
}

struct CollectingSink {
    chunks: Arc<parking_lot::Mutex<Vec<i32>>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl CollectingSink {
    fn new() -> (
        Self,
        Arc<parking_lot::Mutex<Vec<i32>>>,
        Arc<std::sync::atomic::AtomicBool>,
    ) {
        let chunks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        (
            Self {
                chunks: chunks.clone(),
                closed: closed.clone(),
            },
            chunks,
            closed,
        )
    }
}

impl WritableSink<i32> for CollectingSink {
    async fn write(
        &mut self,
        chunk: i32,
        _controller: &mut WritableStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        self.chunks.lock().push(chunk);
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FailOnSecondWriteSink {
    written: usize,
}

impl WritableSink<i32> for FailOnSecondWriteSink {
    async fn write(
        &mut self,
        _chunk: i32,
        _controller: &mut WritableStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        self.written += 1;
        if self.written == 2 {
            Err(StreamError::from("write exploded"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn simple_enqueue_then_read_to_completion() {
    init_tracing();
    let stream = ReadableStream::builder(UpfrontSource {
        chunks: vec!["a", "b", "c"],
    })
    .strategy(CountQueuingStrategy::new(8))
    .spawn(tokio::spawn);
    let (_locked, reader) = stream.get_reader().unwrap();

    assert_eq!(reader.read().await.unwrap(), Some("a"));
    assert_eq!(reader.read().await.unwrap(), Some("b"));
    assert_eq!(reader.read().await.unwrap(), Some("c"));
    assert_eq!(reader.read().await.unwrap(), None);
    reader.closed().await.unwrap();
}

#[tokio::test]
async fn transform_identity_pipeline_delivers_everything() {
    init_tracing();
    let source = ReadableStream::from_iterator(vec![1, 2, 3].into_iter()).spawn(tokio::spawn);
    let transform = TransformStream::builder(IdentityTransformer::<i32>::new()).spawn(tokio::spawn);
    let (sink, chunks, closed) = CollectingSink::new();
    let dest = WritableStream::builder(sink).spawn(tokio::spawn);

    let piped = source.pipe_through(transform, None, tokio::spawn);
    timeout(Duration::from_secs(2), piped.pipe_to(&dest, None))
        .await
        .expect("pipeline hung")
        .unwrap();

    assert_eq!(*chunks.lock(), vec![1, 2, 3]);
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn destination_write_failure_cancels_source_with_the_error() {
    init_tracing();
    let (source, cancels, reason) = CancelProbeSource::new(vec![1, 2, 3, 4]);
    let stream = ReadableStream::builder(source).spawn(tokio::spawn);
    let dest = WritableStream::builder(FailOnSecondWriteSink { written: 0 }).spawn(tokio::spawn);

    let result = timeout(Duration::from_secs(2), stream.pipe_to(&dest, None))
        .await
        .expect("pipe hung");

    let error = result.expect_err("pipe should reject with the write error");
    assert!(error.to_string().contains("write exploded"));

    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    let recorded = reason.lock().take().flatten();
    assert!(
        matches!(&recorded, Some(e) if e.to_string().contains("write exploded")),
        "source must be canceled with the destination's error, got {:?}",
        recorded
    );
}

#[tokio::test]
async fn source_close_propagates_to_destination() {
    init_tracing();
    let source = ReadableStream::from_iterator(vec![1, 2].into_iter()).spawn(tokio::spawn);
    let (sink, chunks, closed) = CollectingSink::new();
    let dest = WritableStream::builder(sink).spawn(tokio::spawn);

    timeout(Duration::from_secs(2), source.pipe_to(&dest, None))
        .await
        .expect("pipe hung")
        .unwrap();

    assert_eq!(*chunks.lock(), vec![1, 2]);
    assert!(closed.load(Ordering::SeqCst));

    // The pipe released both endpoints before settling.
    let (_locked, _writer) = dest.get_writer().unwrap();
}

#[tokio::test]
async fn prevent_close_leaves_destination_open() {
    init_tracing();
    let source = ReadableStream::from_iterator(vec![5].into_iter()).spawn(tokio::spawn);
    let (sink, chunks, closed) = CollectingSink::new();
    let dest = WritableStream::builder(sink).spawn(tokio::spawn);

    let options = StreamPipeOptions {
        prevent_close: true,
        ..Default::default()
    };
    timeout(Duration::from_secs(2), source.pipe_to(&dest, Some(options)))
        .await
        .expect("pipe hung")
        .unwrap();

    assert!(!closed.load(Ordering::SeqCst));

    // The destination is still writable: queue more and close it ourselves.
    let (_locked, writer) = dest.get_writer().unwrap();
    writer.write(6).await.unwrap();
    writer.close().await.unwrap();
    assert_eq!(*chunks.lock(), vec![5, 6]);
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn prevent_abort_leaves_destination_writable_after_source_error() {
    init_tracing();
    struct FailingSource;

    impl ReadableSource<i32> for FailingSource {
        async fn pull(
            &mut self,
            _controller: &mut ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            Err(StreamError::from("source broke"))
        }
    }

    let stream = ReadableStream::builder(FailingSource).spawn(tokio::spawn);
    let (sink, _chunks, _closed) = CollectingSink::new();
    let dest = WritableStream::builder(sink).spawn(tokio::spawn);

    let options = StreamPipeOptions {
        prevent_abort: true,
        ..Default::default()
    };
    let result = timeout(Duration::from_secs(2), stream.pipe_to(&dest, Some(options)))
        .await
        .expect("pipe hung");
    assert!(result.is_err());

    let (_locked, writer) = dest.get_writer().unwrap();
    writer.write(1).await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn abort_signal_tears_down_both_endpoints() {
    init_tracing();
    let (source, cancels, reason) = CancelProbeSource::new(Vec::new());
    let stream = ReadableStream::builder(source)
        .strategy(CountQueuingStrategy::new(0))
        .spawn(tokio::spawn);
    let (sink, _chunks, _closed) = CollectingSink::new();
    let dest = WritableStream::builder(sink).spawn(tokio::spawn);

    let (handle, registration) = AbortHandle::new_pair();
    let options = StreamPipeOptions {
        signal: Some(registration),
        ..Default::default()
    };

    let dest_for_pipe = dest;
    let pipe = tokio::spawn(async move {
        let result = stream.pipe_to(&dest_for_pipe, Some(options)).await;
        (result, dest_for_pipe)
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();

    let (result, dest) = timeout(Duration::from_secs(2), pipe)
        .await
        .expect("pipe hung")
        .unwrap();

    let error = result.expect_err("aborted pipe must reject");
    assert!(matches!(error, StreamError::Aborted(_)));

    // Destination errored with the abort reason.
    let close_result = dest.close().await;
    assert!(matches!(close_result, Err(StreamError::Aborted(_))));

    // Source was canceled once with the same reason.
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    let recorded = reason.lock().take().flatten();
    assert!(matches!(recorded, Some(StreamError::Aborted(_))));
}

#[tokio::test]
async fn tee_branch_cancellation_follows_the_composite_protocol() {
    init_tracing();
    let (source, cancels, reason) = CancelProbeSource::new((1..=10).map(|i| i * 10).collect());
    let stream = ReadableStream::builder(source).spawn(tokio::spawn);
    let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

    let cancel1 = branch1.cancel(Some(StreamError::Aborted(Some("r1".into()))));
    tokio::task::yield_now().await;
    assert_eq!(cancels.load(Ordering::SeqCst), 0);

    // The surviving branch keeps reading while the first cancel is pending.
    let (_locked, reader2) = branch2.get_reader().unwrap();
    assert_eq!(reader2.read().await.unwrap(), Some(10));
    assert_eq!(reader2.read().await.unwrap(), Some(20));

    let branch2 = reader2.release_lock();
    let cancel2 = branch2.cancel(Some(StreamError::Aborted(Some("r2".into()))));
    timeout(Duration::from_secs(2), cancel2)
        .await
        .expect("second branch cancel hung")
        .unwrap();
    timeout(Duration::from_secs(2), cancel1)
        .await
        .expect("first branch cancel hung")
        .unwrap();
    assert_eq!(branch2.state(), StreamState::Closed);

    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    let recorded = reason.lock().take().flatten();
    match recorded {
        Some(StreamError::Composite(reasons)) => {
            assert_eq!(reasons.len(), 2);
            assert!(matches!(&reasons[0], StreamError::Aborted(Some(r)) if r == "r1"));
            assert!(matches!(&reasons[1], StreamError::Aborted(Some(r)) if r == "r2"));
        }
        other => panic!("expected composite reason, got {:?}", other),
    }
}

#[tokio::test]
async fn backpressured_transform_bounds_readahead() {
    init_tracing();
    struct CountingIdentity {
        transformed: Arc<AtomicUsize>,
    }

    impl rivulet::Transformer<i32, i32> for CountingIdentity {
        async fn transform(
            &mut self,
            chunk: i32,
            controller: &mut rivulet::TransformStreamDefaultController<i32, i32>,
        ) -> StreamResult<()> {
            self.transformed.fetch_add(1, Ordering::SeqCst);
            controller.enqueue(chunk)
        }
    }

    let transformed = Arc::new(AtomicUsize::new(0));
    let transform = TransformStream::builder(CountingIdentity {
        transformed: transformed.clone(),
    })
    .spawn(tokio::spawn);
    let (readable, writable) = transform.split();
    let (_ls, writer) = writable.get_writer().unwrap();

    // Queue several writes without reading: with a readable high-water mark
    // of zero, at most one chunk may be transformed ahead of the consumer.
    let _w1 = writer.write(1);
    let _w2 = writer.write(2);
    let _w3 = writer.write(3);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(transformed.load(Ordering::SeqCst) <= 1);

    let (_lr, reader) = readable.get_reader().unwrap();
    assert_eq!(reader.read().await.unwrap(), Some(1));
    assert_eq!(reader.read().await.unwrap(), Some(2));
    assert_eq!(reader.read().await.unwrap(), Some(3));
    assert_eq!(transformed.load(Ordering::SeqCst), 3);
}
