use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Coarse protocol kind a captured mock belongs to.
///
/// HTTP is the only kind with a dedicated engine today; the others are
/// reserved for protocol plugins registered with the dispatcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MockKind {
    Http,
    Generic,
    Grpc,
}

/// One side (request or response) of a captured exchange, already
/// canonicalized: headers are lower-cased and sorted, body is decoded
/// (gzip stripped) and query parameters broken out of the URL.
#[derive(Clone, Debug, Default)]
pub struct CanonicalPayload {
    pub status_or_method: String,
    pub url_or_empty: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

/// A completed request/response exchange, canonicalized and ready for
/// the external persistence collaborator to serialize.
///
/// Produced once per HTTP transaction by the capture sink. The sink
/// never retains these after handing them off; serialization format
/// and storage are entirely the collaborator's concern.
#[derive(Clone, Debug)]
pub struct CapturedMock {
    pub kind: MockKind,
    pub request: CanonicalPayload,
    pub response: CanonicalPayload,
    pub request_at_ms: i64,
    pub response_at_ms: i64,
    pub destination_port: u16,
}

/// Storage-agnostic trait for the external collaborator that receives
/// captured mocks.
///
/// The capture sink never blocks on this trait directly; it drives an
/// unbounded channel (see [`sink_channel`]) and a background forwarder
/// task calls `store` for each item pulled off the channel. Implementers
/// decide serialization format and persistence; this crate only defines
/// the narrow interface and the record shape crossing it.
#[async_trait]
pub trait MockSink: Send + Sync {
    async fn store(&self, mock: CapturedMock) -> anyhow::Result<()>;
}

pub type DynMockSink = Arc<dyn MockSink>;

/// Sending half of the outbound mock stream (§6, "Outbound mock stream").
///
/// Cloneable; every HTTP engine task holds one. Sends never block: the
/// channel is unbounded, so a slow or absent collaborator cannot stall
/// the proxy's request-lifecycle engine. Backpressure is explicitly out
/// of scope for this interface.
#[derive(Clone, Debug)]
pub struct MockSinkSender(tokio::sync::mpsc::UnboundedSender<CapturedMock>);

impl MockSinkSender {
    pub fn send(&self, mock: CapturedMock) {
        // Closed receiver means the forwarder task has shut down; dropping
        // the mock is correct, there is nowhere left to deliver it.
        let _ = self.0.send(mock);
    }
}

/// Creates the channel pair backing the outbound mock stream: a
/// cloneable sender for capture-sink producers and a receiver meant to
/// be driven by a single forwarder task that calls into a [`DynMockSink`].
pub fn sink_channel() -> (MockSinkSender, tokio::sync::mpsc::UnboundedReceiver<CapturedMock>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (MockSinkSender(tx), rx)
}

/// Drains the receiver half of [`sink_channel`] into a [`DynMockSink`]
/// until the sender side is dropped.
///
/// Grounded on the same single-producer, at-least-once-delivery intent
/// as a claim/ack repository, but simplified to the unbounded-channel
/// contract the core specifies: no lease, no retry, no retention.
pub async fn forward_to_sink(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<CapturedMock>,
    sink: DynMockSink,
) {
    while let Some(mock) = rx.recv().await {
        if let Err(error) = sink.store(mock).await {
            tracing::warn!(%error, "mock sink rejected a captured record");
        }
    }
}
