use crate::api::stream::{DecodeEvent, StreamDecoder};
use crate::error::Fault;
use crate::state::message_store::LocalKey;
use crate::types::{ContextId, DocumentId, StreamMetadata};
use tokio_util::sync::CancellationToken;

/// Lets the engine stop reading a reply. The server keeps generating and
/// persisting it; only the client stops listening.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    token: CancellationToken,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detach(&self) {
        self.token.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn detached(&self) {
        self.token.cancelled().await;
    }
}

/// Read side of one streaming reply, bound to the context it was started in.
pub struct Session {
    target: ContextId,
    assistant_key: LocalKey,
    accumulated: String,
    metadata: Option<StreamMetadata>,
    decoder: StreamDecoder,
}

impl Session {
    pub fn new(target: ContextId, assistant_key: LocalKey, decoder: StreamDecoder) -> Self {
        Self {
            target,
            assistant_key,
            accumulated: String::new(),
            metadata: None,
            decoder,
        }
    }

    pub fn target(&self) -> &ContextId {
        &self.target
    }

    pub fn assistant_key(&self) -> LocalKey {
        self.assistant_key
    }

    /// Visible text received so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.metadata.as_ref().map(|metadata| &metadata.document_id)
    }

    /// Feeds one chunk. Returns whether the visible text grew.
    pub fn ingest(&mut self, chunk: &[u8]) -> bool {
        let events = self.decoder.process(chunk);
        self.absorb(events)
    }

    /// Flushes the decoder at end of stream.
    pub fn finish(&mut self) -> bool {
        let events = self.decoder.finish();
        self.absorb(events)
    }

    fn absorb(&mut self, events: Vec<DecodeEvent>) -> bool {
        let before = self.accumulated.len();
        for event in events {
            match event {
                DecodeEvent::TextDelta(text) => self.accumulated.push_str(&text),
                DecodeEvent::Metadata(metadata) => {
                    tracing::debug!(
                        context = %self.target,
                        document = %metadata.document_id,
                        "reply metadata received"
                    );
                    self.metadata = Some(metadata);
                }
                DecodeEvent::Fault(fault) => Fault::from(fault).report(),
            }
        }
        self.accumulated.len() > before
    }
}
