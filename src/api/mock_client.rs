use crate::api::{Backend, ByteStream};
use crate::types::{
    ContextId, ContextKind, ContextRecord, DocumentBody, DocumentId, Role, TurnRequest,
};
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// One piece of a scripted reply body.
#[derive(Debug, Clone)]
pub enum MockChunk {
    Text(String),
    Bytes(Vec<u8>),
    /// Ends the stream with a transport error.
    Fail(String),
}

impl MockChunk {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    fn into_item(self) -> Result<Bytes> {
        match self {
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Bytes(bytes) => Ok(Bytes::from(bytes)),
            Self::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Pushes chunks into a reply that is already streaming. Dropping the feed
/// ends the stream.
pub struct ReplyFeed {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
}

impl ReplyFeed {
    pub fn send_text(&self, text: &str) -> bool {
        self.tx.send(Ok(Bytes::from(text.to_string()))).is_ok()
    }

    pub fn send_bytes(&self, bytes: &[u8]) -> bool {
        self.tx.send(Ok(Bytes::copy_from_slice(bytes))).is_ok()
    }

    pub fn fail(&self, message: &str) -> bool {
        self.tx.send(Err(anyhow!(message.to_string()))).is_ok()
    }
}

enum ReplySource {
    Scripted {
        chunks: Vec<MockChunk>,
        persist: Option<(DocumentId, String)>,
    },
    Feed(mpsc::UnboundedReceiver<Result<Bytes>>),
}

/// Recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateContext(ContextKind),
    ListContexts(ContextKind),
    Rename { id: ContextId, title: String },
    Delete(ContextId),
    ListIds {
        context: ContextId,
        before: Option<DocumentId>,
        limit: usize,
    },
    GetMessage(DocumentId),
    SendTurn(TurnRequest),
    Summarize(Vec<String>),
}

#[derive(Default)]
struct MockState {
    contexts: Vec<ContextRecord>,
    documents: HashMap<DocumentId, DocumentBody>,
    order: HashMap<ContextId, Vec<DocumentId>>,
    replies: VecDeque<ReplySource>,
    fetch_delays: HashMap<DocumentId, Duration>,
    list_delays: HashMap<ContextId, Duration>,
    page_overlap: usize,
    summarize_delay: Option<Duration>,
    failing_ids: HashSet<DocumentId>,
    create_delay: Option<Duration>,
    title: Option<String>,
    calls: Vec<MockCall>,
    next_id: u64,
}

impl MockState {
    fn issue_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn store_document(&mut self, context_id: &ContextId, document: DocumentBody) {
        self.order
            .entry(context_id.clone())
            .or_default()
            .push(document.id.clone());
        self.documents.insert(document.id.clone(), document);
    }
}

/// In-memory backend holding contexts and their documents, with scripted
/// replies and per-document fetch delays.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_context(&self, record: ContextRecord) -> ContextRecord {
        self.state().contexts.push(record.clone());
        record
    }

    pub fn context(&self, id: &ContextId) -> Option<ContextRecord> {
        self.state()
            .contexts
            .iter()
            .find(|record| &record.id == id)
            .cloned()
    }

    pub fn add_document(&self, context_id: &ContextId, role: Role, content: &str) -> DocumentId {
        let mut state = self.state();
        let id = DocumentId::new(state.issue_id("doc"));
        state.store_document(
            context_id,
            DocumentBody {
                id: id.clone(),
                role,
                content: content.to_string(),
                created_at: None,
            },
        );
        id
    }

    pub fn add_document_with_id(
        &self,
        context_id: &ContextId,
        id: &str,
        role: Role,
        content: &str,
    ) -> DocumentId {
        let id = DocumentId::new(id);
        self.state().store_document(
            context_id,
            DocumentBody {
                id: id.clone(),
                role,
                content: content.to_string(),
                created_at: None,
            },
        );
        id
    }

    pub fn document_ids(&self, context_id: &ContextId) -> Vec<DocumentId> {
        self.state()
            .order
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn script_reply(&self, chunks: Vec<MockChunk>) {
        self.state().replies.push_back(ReplySource::Scripted {
            chunks,
            persist: None,
        });
    }

    /// Scripted reply that the server also stores as an assistant document.
    pub fn script_persisted_reply(
        &self,
        chunks: Vec<MockChunk>,
        document_id: &str,
        stored_content: &str,
    ) {
        self.state().replies.push_back(ReplySource::Scripted {
            chunks,
            persist: Some((DocumentId::new(document_id), stored_content.to_string())),
        });
    }

    pub fn script_feed_reply(&self) -> ReplyFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().replies.push_back(ReplySource::Feed(rx));
        ReplyFeed { tx }
    }

    pub fn set_fetch_delay(&self, id: &str, delay: Duration) {
        self.state().fetch_delays.insert(DocumentId::new(id), delay);
    }

    /// Delays every id listing for `context_id`.
    pub fn set_list_delay(&self, context_id: &ContextId, delay: Duration) {
        self.state().list_delays.insert(context_id.clone(), delay);
    }

    /// Older pages also repeat this many ids from the newer side of the
    /// boundary, like a server whose `before` bound is inclusive.
    pub fn set_page_overlap(&self, overlap: usize) {
        self.state().page_overlap = overlap;
    }

    pub fn set_summarize_delay(&self, delay: Duration) {
        self.state().summarize_delay = Some(delay);
    }

    pub fn fail_fetch(&self, id: &str) {
        self.state().failing_ids.insert(DocumentId::new(id));
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    pub fn set_title(&self, title: &str) {
        self.state().title = Some(title.to_string());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn summarize_calls(&self) -> Vec<Vec<String>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Summarize(texts) => Some(texts.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.state().calls.push(call);
    }
}

impl Backend for MockBackend {
    async fn create_context(&self, kind: ContextKind) -> Result<ContextRecord> {
        self.record(MockCall::CreateContext(kind));
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        let prefix = match kind {
            ContextKind::Conversation => "conv",
            ContextKind::Work => "work",
        };
        let record = ContextRecord::new(
            ContextId::new(state.issue_id(prefix)),
            kind,
            kind.default_title(),
        );
        state.contexts.push(record.clone());
        Ok(record)
    }

    async fn list_contexts(&self, kind: ContextKind) -> Result<Vec<ContextRecord>> {
        self.record(MockCall::ListContexts(kind));
        Ok(self
            .state()
            .contexts
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect())
    }

    async fn rename_context(&self, _kind: ContextKind, id: &ContextId, title: &str) -> Result<()> {
        self.record(MockCall::Rename {
            id: id.clone(),
            title: title.to_string(),
        });
        let mut state = self.state();
        let Some(record) = state.contexts.iter_mut().find(|record| &record.id == id) else {
            bail!("MockBackend: unknown context {id}");
        };
        record.title = title.to_string();
        Ok(())
    }

    async fn delete_context(&self, _kind: ContextKind, id: &ContextId) -> Result<()> {
        self.record(MockCall::Delete(id.clone()));
        let mut state = self.state();
        state.contexts.retain(|record| &record.id != id);
        if let Some(ids) = state.order.remove(id) {
            for doc_id in ids {
                state.documents.remove(&doc_id);
            }
        }
        Ok(())
    }

    async fn list_message_ids(
        &self,
        _kind: ContextKind,
        id: &ContextId,
        before: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        self.record(MockCall::ListIds {
            context: id.clone(),
            before: before.cloned(),
            limit,
        });
        let delay = self.state().list_delays.get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        let all = state.order.get(id).map(Vec::as_slice).unwrap_or_default();
        let end = match before {
            Some(before) => all
                .iter()
                .position(|doc| doc == before)
                .map_or(0, |end| (end + state.page_overlap).min(all.len())),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(all[start..end].to_vec())
    }

    async fn get_message(&self, _kind: ContextKind, id: &DocumentId) -> Result<DocumentBody> {
        self.record(MockCall::GetMessage(id.clone()));
        let delay = self.state().fetch_delays.get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        if state.failing_ids.contains(id) {
            bail!("MockBackend: fetch of {id} failed");
        }
        state
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("MockBackend: document {id} not found"))
    }

    async fn send_turn(&self, request: &TurnRequest) -> Result<ByteStream> {
        self.record(MockCall::SendTurn(request.clone()));
        let mut state = self.state();
        let Some(source) = state.replies.pop_front() else {
            bail!("MockBackend: no more replies configured");
        };

        if let Some(context_id) = request.context_id.as_ref() {
            let user_doc = DocumentBody {
                id: DocumentId::new(state.issue_id("doc")),
                role: Role::User,
                content: request.user_text.clone(),
                created_at: None,
            };
            state.store_document(context_id, user_doc);
        }

        match source {
            ReplySource::Scripted { chunks, persist } => {
                if let (Some((id, content)), Some(context_id)) =
                    (persist, request.context_id.as_ref())
                {
                    state.store_document(
                        context_id,
                        DocumentBody {
                            id,
                            role: Role::Assistant,
                            content,
                            created_at: None,
                        },
                    );
                }
                let items: Vec<Result<Bytes>> =
                    chunks.into_iter().map(MockChunk::into_item).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            ReplySource::Feed(rx) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
        }
    }

    async fn summarize_title(&self, user_texts: &[String]) -> Result<String> {
        self.record(MockCall::Summarize(user_texts.to_vec()));
        let delay = self.state().summarize_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state().title.clone() {
            Some(title) => Ok(title),
            None => bail!("MockBackend: no title configured"),
        }
    }
}
