// FILE: src/fanout.rs
//! The Streaming Fan-out (§4.4). Every `RequestContext` carries a sink that
//! belongs to exactly one transport and one connection; the controller
//! never consults a global or "current" session, so mis-attribution is
//! prevented structurally rather than by convention.

use crate::model::{CommandResult, StreamChunk};
use async_trait::async_trait;

/// The per-request writer through which all stream chunks and the final
/// result for one command flow to the originating connection. A `Sink`
/// never blocks the controller: if it cannot accept a chunk within a short
/// bound it drops the chunk (§5 back-pressure policy) — heartbeats are
/// idempotent, so skipping one is safe.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, chunk: StreamChunk);
    async fn send_result(&self, result: &CommandResult);
}

/// Bound within which a sink must accept a chunk before it is dropped
/// (§5: "default 100 ms").
pub const SINK_BACKPRESSURE_BOUND: std::time::Duration = std::time::Duration::from_millis(100);

/// Sends through `send` with the standard back-pressure bound, dropping
/// the chunk silently on timeout or closed channel — used by every
/// concrete sink so the drop policy lives in one place.
pub async fn send_with_backpressure<T, F, Fut>(value: T, send: F)
where
    F: FnOnce(T) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let _ = tokio::time::timeout(SINK_BACKPRESSURE_BOUND, send(value)).await;
}

/// A sink with nowhere to go — used for commands issued without a live
/// client connection (e.g. internal health checks). Publications are
/// simply discarded.
pub struct NullSink;

#[async_trait]
impl ChunkSink for NullSink {
    async fn send_chunk(&self, _chunk: StreamChunk) {}
    async fn send_result(&self, _result: &CommandResult) {}
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    /// Records every publication it receives, for assertions in controller
    /// tests (§8 ordering/attribution properties).
    #[derive(Default)]
    pub struct RecordingSink {
        pub chunks: Mutex<Vec<StreamChunk>>,
        pub results: Mutex<Vec<CommandResult>>,
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn send_chunk(&self, chunk: StreamChunk) {
            self.chunks.lock().await.push(chunk);
        }
        async fn send_result(&self, result: &CommandResult) {
            self.results.lock().await.push(result.clone());
        }
    }
}
