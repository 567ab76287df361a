use super::state::{ChatEngine, EngineState, EngineUpdate, TurnOutcome, ViewGuard};
use crate::api::stream::StreamDecoder;
use crate::api::Backend;
use crate::error::{EngineError, Fault};
use crate::state::message_store::LocalKey;
use crate::state::session::{Session, SessionHandle};
use crate::state::target::CreateOutcome;
use crate::types::{ContextKind, ContextRecord, Role, TurnRequest};
use anyhow::Result;
use futures::StreamExt;

enum Target {
    Bound(ContextRecord),
    Create(ContextKind),
}

enum ReadStep<T> {
    Detached,
    Item(Option<T>),
}

enum TurnStart {
    Started {
        guard: ViewGuard,
        assistant_key: LocalKey,
        session_id: u64,
        handle: SessionHandle,
    },
    /// The view is still loading its latest page.
    Loading,
    Left,
}

fn start_turn(
    state: &mut EngineState,
    record: &ContextRecord,
    text: &str,
) -> Result<TurnStart, EngineError> {
    let Some(guard) = state.guard().filter(|guard| guard.context == record.id) else {
        return Ok(TurnStart::Left);
    };
    if state.is_streaming(&record.id) {
        return Err(EngineError::TurnInProgress);
    }
    if state.hydrating {
        return Ok(TurnStart::Loading);
    }
    let Some((user_key, assistant_key)) = state.store.begin_turn(&record.id, text) else {
        return Ok(TurnStart::Left);
    };
    state.emit(EngineUpdate::MessageAppended {
        local_key: user_key,
        role: Role::User,
        content: text.to_string(),
    });
    state.emit(EngineUpdate::MessageAppended {
        local_key: assistant_key,
        role: Role::Assistant,
        content: String::new(),
    });
    let (session_id, handle) = state.start_session(record.id.clone());
    Ok(TurnStart::Started {
        guard,
        assistant_key,
        session_id,
        handle,
    })
}

impl<B: Backend> ChatEngine<B> {
    /// Sends one user turn to the active context, creating the context first
    /// when none is bound, and streams the reply into the log.
    ///
    /// Resolves once the reply ends, fails, or the user moves to another
    /// context.
    pub async fn send_message(&self, text: &str) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyMessage.into());
        }

        let record = match self.resolve_target().await? {
            Some(record) => record,
            None => return Ok(TurnOutcome::Detached),
        };
        let decoder = StreamDecoder::new(self.settings.sentinels.clone())?;

        let (guard, assistant_key, session_id, handle) = loop {
            self.history_loaded().await;
            match self.with_state(|state| start_turn(state, &record, text))? {
                TurnStart::Started {
                    guard,
                    assistant_key,
                    session_id,
                    handle,
                } => break (guard, assistant_key, session_id, handle),
                TurnStart::Loading => continue,
                TurnStart::Left => {
                    tracing::debug!(context = %record.id, "context left before the turn started");
                    return Ok(TurnOutcome::Detached);
                }
            }
        };

        let mut session = Session::new(record.id.clone(), assistant_key, decoder);
        let request = TurnRequest {
            kind: record.kind,
            context_id: Some(record.id.clone()),
            model: self.settings.model.clone(),
            user_text: text.to_string(),
        };
        tracing::info!(context = %record.id, kind = record.kind.label(), "sending turn");

        // The request is never cancelled once issued; detaching only stops
        // the read below.
        let mut stream = match self.backend.send_turn(&request).await {
            Ok(stream) => stream,
            Err(error) => return Ok(self.fail_turn(&guard, &session, session_id, &error)),
        };

        loop {
            let step = tokio::select! {
                biased;
                _ = handle.detached() => ReadStep::Detached,
                item = stream.next() => ReadStep::Item(item),
            };
            match step {
                ReadStep::Detached => {
                    tracing::info!(context = %record.id, "stopped reading detached reply");
                    return Ok(TurnOutcome::Detached);
                }
                ReadStep::Item(Some(Ok(chunk))) => {
                    if session.ingest(&chunk) && !self.publish_progress(&guard, &session) {
                        return Ok(self.abandon(&guard, session_id, &handle));
                    }
                }
                ReadStep::Item(Some(Err(error))) => {
                    return Ok(self.fail_turn(&guard, &session, session_id, &error));
                }
                ReadStep::Item(None) => break,
            }
        }

        if session.finish() && !self.publish_progress(&guard, &session) {
            return Ok(self.abandon(&guard, session_id, &handle));
        }

        let document_id = session.document_id().cloned();
        if document_id.is_none() {
            tracing::warn!(context = %record.id, "reply ended without a document id");
        }
        self.with_state(|state| {
            state.end_session(session_id);
            if !state.holds(&guard) {
                state.drop_stale(&guard);
                return;
            }
            if state
                .store
                .finalize(&guard.context, assistant_key, document_id.clone())
            {
                state.emit(EngineUpdate::Finalized {
                    local_key: assistant_key,
                    document_id: document_id.clone(),
                });
            }
        });

        Ok(TurnOutcome::Completed {
            text: session.text().to_string(),
            document_id,
        })
    }

    /// Returns once the active view has its latest page on screen.
    async fn history_loaded(&self) {
        loop {
            let notified = self.hydrated.notified();
            if !self.with_state(|state| state.hydrating) {
                return;
            }
            notified.await;
        }
    }

    /// The bound record for the active kind, creating one on first use.
    /// `None` when the user moved on while the create was in flight.
    async fn resolve_target(&self) -> Result<Option<ContextRecord>> {
        let target = self.with_state(|state| match state.targets.active() {
            Some(record) if state.is_streaming(&record.id) => Err(EngineError::TurnInProgress),
            Some(record) => Ok(Target::Bound(record.clone())),
            None => {
                let kind = state.targets.active_kind();
                state.targets.begin_create(kind)?;
                Ok(Target::Create(kind))
            }
        })?;

        let kind = match target {
            Target::Bound(record) => return Ok(Some(record)),
            Target::Create(kind) => kind,
        };

        let record = match self.backend.create_context(kind).await {
            Ok(record) => record,
            Err(error) => {
                self.with_state(|state| state.targets.abandon_create(kind));
                return Err(error.context(format!("failed to create {}", kind.label())));
            }
        };
        tracing::info!(context = %record.id, kind = kind.label(), "created context");

        let outcome = self.with_state(|state| {
            let outcome = state.targets.complete_create(record.clone());
            if outcome != CreateOutcome::Superseded {
                state.emit(EngineUpdate::ContextCreated(record.clone()));
            }
            if outcome == CreateOutcome::Active {
                state.store.adopt(record.id.clone());
            }
            outcome
        });

        match outcome {
            CreateOutcome::Active => Ok(Some(record)),
            CreateOutcome::Inactive | CreateOutcome::Superseded => {
                tracing::debug!(context = %record.id, ?outcome, "created context is not active");
                Ok(None)
            }
        }
    }

    /// Applies the session's cumulative text. False once the view it was
    /// started in is gone.
    fn publish_progress(&self, guard: &ViewGuard, session: &Session) -> bool {
        self.with_state(|state| {
            if !state.holds(guard) {
                state.drop_stale(guard);
                return false;
            }
            if let Some(appended) =
                state
                    .store
                    .apply_delta(&guard.context, session.assistant_key(), session.text())
            {
                state.emit(EngineUpdate::ContentGrew {
                    local_key: session.assistant_key(),
                    appended,
                });
            }
            true
        })
    }

    fn abandon(&self, guard: &ViewGuard, session_id: u64, handle: &SessionHandle) -> TurnOutcome {
        handle.detach();
        self.with_state(|state| state.end_session(session_id));
        tracing::debug!(context = %guard.context, "reply target no longer visible");
        TurnOutcome::Detached
    }

    fn fail_turn(
        &self,
        guard: &ViewGuard,
        session: &Session,
        session_id: u64,
        error: &anyhow::Error,
    ) -> TurnOutcome {
        let fault = Fault::Transport(format!("{error:#}"));
        fault.report();
        let notice = format!("[error] {fault}");

        self.with_state(|state| {
            state.end_session(session_id);
            if !state.holds(guard) {
                state.drop_stale(guard);
                return;
            }
            if state
                .store
                .fail_turn(&guard.context, session.assistant_key(), &notice)
            {
                state.emit(EngineUpdate::TurnFailed {
                    local_key: session.assistant_key(),
                    notice: notice.clone(),
                });
            }
        });

        TurnOutcome::Failed {
            partial: session.text().to_string(),
            error: fault.to_string(),
        }
    }
}
