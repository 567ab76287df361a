use crate::api::stream::SentinelPair;
use crate::api::Backend;
use crate::config::Config;
use crate::error::Fault;
use crate::state::cursor::PageCursor;
use crate::state::message_store::{LocalKey, Message, MessageStore};
use crate::state::session::SessionHandle;
use crate::state::target::TargetContexts;
use crate::types::{ContextId, ContextKind, ContextRecord, DocumentId, Role};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub page_size: usize,
    pub refetch_delay: Duration,
    pub sentinels: SentinelPair,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            page_size: config.page_size,
            refetch_delay: config.refetch_delay,
            sentinels: config.sentinels()?,
        })
    }
}

/// Changes to the visible log, sent only after they were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    LogReset {
        context: Option<ContextRecord>,
    },
    MessageAppended {
        local_key: LocalKey,
        role: Role,
        content: String,
    },
    ContentGrew {
        local_key: LocalKey,
        appended: String,
    },
    Finalized {
        local_key: LocalKey,
        document_id: Option<DocumentId>,
    },
    TurnFailed {
        local_key: LocalKey,
        notice: String,
    },
    HistoryPrepended {
        count: usize,
        has_more: bool,
    },
    HistoryReplaced {
        count: usize,
    },
    ContextCreated(ContextRecord),
    TitleChanged {
        context: ContextId,
        title: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        text: String,
        document_id: Option<DocumentId>,
    },
    /// The user moved away; the server still finishes and stores the reply.
    Detached,
    Failed {
        partial: String,
        error: String,
    },
}

/// Point-in-time copy of what the user is looking at.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub kind: ContextKind,
    pub context: Option<ContextRecord>,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub streaming: bool,
}

pub(super) struct LiveSession {
    pub(super) id: u64,
    pub(super) context: ContextId,
    pub(super) handle: SessionHandle,
}

/// Identifies one showing of one context. Switching away and back yields a
/// different guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ViewGuard {
    pub(super) context: ContextId,
    epoch: u64,
}

pub(super) struct EngineState {
    pub(super) targets: TargetContexts,
    pub(super) store: MessageStore,
    pub(super) cursor: PageCursor,
    pub(super) live: Option<LiveSession>,
    /// Set while the current view waits for its latest page.
    pub(super) hydrating: bool,
    /// Contexts the user titled by hand; auto-title leaves them alone.
    pub(super) renamed: HashSet<ContextId>,
    epoch: u64,
    next_session_id: u64,
    subscribers: Vec<mpsc::UnboundedSender<EngineUpdate>>,
}

impl EngineState {
    fn new(page_size: usize) -> Self {
        Self {
            targets: TargetContexts::new(ContextKind::Conversation),
            store: MessageStore::new(),
            cursor: PageCursor::new(page_size),
            live: None,
            hydrating: false,
            renamed: HashSet::new(),
            epoch: 0,
            next_session_id: 0,
            subscribers: Vec::new(),
        }
    }

    pub(super) fn emit(&mut self, update: EngineUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub(super) fn guard(&self) -> Option<ViewGuard> {
        self.targets.active_id().map(|id| ViewGuard {
            context: id.clone(),
            epoch: self.epoch,
        })
    }

    /// Whether the view `guard` was taken from is still on screen.
    pub(super) fn holds(&self, guard: &ViewGuard) -> bool {
        self.epoch == guard.epoch && self.targets.is_active(&guard.context)
    }

    pub(super) fn start_session(&mut self, context: ContextId) -> (u64, SessionHandle) {
        self.next_session_id += 1;
        let handle = SessionHandle::new();
        self.live = Some(LiveSession {
            id: self.next_session_id,
            context,
            handle: handle.clone(),
        });
        (self.next_session_id, handle)
    }

    pub(super) fn end_session(&mut self, session_id: u64) {
        if self.live.as_ref().is_some_and(|live| live.id == session_id) {
            self.live = None;
        }
    }

    pub(super) fn is_streaming(&self, context: &ContextId) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| &live.context == context)
    }

    pub(super) fn detach_live(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::debug!(context = %live.context, session = live.id, "detaching reply stream");
            live.handle.detach();
        }
    }

    /// Empties the log and hands it to whatever is now active.
    pub(super) fn reset_view(&mut self) {
        self.epoch += 1;
        let active = self.targets.active().cloned();
        self.store.reset(active.as_ref().map(|record| record.id.clone()));
        self.cursor.reset();
        self.hydrating = active.is_some();
        self.emit(EngineUpdate::LogReset { context: active });
    }

    /// Ends the loading phase of the view `guard` was taken from. A newer
    /// view keeps its own flag.
    pub(super) fn finish_hydration(&mut self, guard: &ViewGuard) {
        if self.epoch == guard.epoch {
            self.hydrating = false;
        }
    }

    /// Whether `id` still carries a placeholder title that nobody replaced.
    pub(super) fn keeps_default_title(&self, id: &ContextId) -> bool {
        !self.renamed.contains(id)
            && self
                .targets
                .find(id)
                .map_or(true, ContextRecord::has_default_title)
    }

    pub(super) fn drop_stale(&self, guard: &ViewGuard) {
        Fault::StaleContext(guard.context.clone()).report();
    }
}

/// Client-side conversation engine. Cheap to clone; clones share state.
pub struct ChatEngine<B: Backend> {
    pub(super) backend: Arc<B>,
    pub(super) settings: Arc<EngineSettings>,
    pub(super) hydrated: Arc<Notify>,
    shared: Arc<Mutex<EngineState>>,
}

impl<B: Backend> Clone for ChatEngine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            settings: Arc::clone(&self.settings),
            hydrated: Arc::clone(&self.hydrated),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend> ChatEngine<B> {
    pub fn new(backend: B, settings: EngineSettings) -> Self {
        Self::with_backend(Arc::new(backend), settings)
    }

    pub fn with_backend(backend: Arc<B>, settings: EngineSettings) -> Self {
        let state = EngineState::new(settings.page_size);
        Self {
            backend,
            settings: Arc::new(settings),
            hydrated: Arc::new(Notify::new()),
            shared: Arc::new(Mutex::new(state)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs `f` under the state lock. Never hold the lock across an await.
    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut guard = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| state.subscribers.push(tx));
        rx
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.with_state(|state| {
            let context = state.targets.active().cloned();
            let streaming = context
                .as_ref()
                .is_some_and(|record| state.is_streaming(&record.id));
            EngineSnapshot {
                kind: state.targets.active_kind(),
                context,
                messages: state.store.messages().to_vec(),
                has_more: state.cursor.has_more,
                streaming,
            }
        })
    }

    pub fn active_context(&self) -> Option<ContextRecord> {
        self.with_state(|state| state.targets.active().cloned())
    }
}
