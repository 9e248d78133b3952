use super::{byte::ReadableByteStreamController, error::StreamError};
use crate::platform::CondSend;
use std::future::Future;

type StreamResult<T> = Result<T, StreamError>;

/// Byte-oriented source. Sizing is fixed to byte length; a custom size
/// function is unrepresentable for byte streams.
pub trait ReadableByteSource: CondSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = controller;
        futures::future::ready(Ok(()))
    }

    /// Produce bytes through the controller. At most one pull is in flight
    /// at a time.
    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + CondSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + CondSend {
        let _ = reason;
        futures::future::ready(Ok(()))
    }
}
