//! Composable asynchronous streams with backpressure for Rust.
//!
//! This crate provides three dataflow primitives (a readable source, a
//! writable sink, and a transform pair coupling the two) together with the
//! controllers producers drive and the readers/writers consumers hold.
//! Each endpoint owns a bounded, size-weighted queue; producers are
//! throttled once queue occupancy reaches a configurable high-water mark.
//!
//! The crate never creates an executor. Builders hand you the stream and a
//! driver future; you spawn the future on whatever runtime you use:
//!
//! ```no_run
//! use rivulet::ReadableStream;
//!
//! # async fn demo() {
//! let stream = ReadableStream::from_iterator(1..=3).spawn(tokio::spawn);
//! let (_locked, reader) = stream.get_reader().unwrap();
//! assert_eq!(reader.read().await.unwrap(), Some(1));
//! # }
//! ```
//!
//! ## Features
//!
//! - **`send` (default)**: multi-threaded handles using `Arc` (requires
//!   `Send + Sync`)
//! - **`local`**: single-threaded handles using `Rc` (no `Send + Sync`
//!   required), for `LocalSet` or WASM executors

#[cfg(all(feature = "send", feature = "local"))]
compile_error!(
    "the 'send' and 'local' features cannot be combined; pick Arc-based \
     multi-threaded streams (default) or Rc-based single-threaded streams \
     (--no-default-features --features local)"
);

#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!(
    "one of the 'send' or 'local' features is required; the default build \
     enables 'send'"
);

mod platform;

pub mod streams;

pub use streams::*;
