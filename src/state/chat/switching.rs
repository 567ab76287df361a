use super::state::{ChatEngine, EngineState, EngineUpdate};
use super::title::should_auto_title;
use crate::api::Backend;
use crate::types::{ContextId, ContextKind, ContextRecord};
use anyhow::{bail, Result};

/// The context being left, and whether it held any user turn.
type Outgoing = Option<(ContextRecord, bool)>;

fn leave_active(state: &mut EngineState) -> Outgoing {
    let outgoing = state.targets.active().cloned()?;
    let had_user_turn = state.store.has_user_turn() || state.cursor.has_more;
    Some((outgoing, had_user_turn))
}

impl<B: Backend> ChatEngine<B> {
    /// Makes `record` the active context and loads its latest page.
    ///
    /// Any reply still streaming is detached, not cancelled. The context
    /// being left gets a generated title when it still has the default one.
    pub async fn switch_to(&self, record: ContextRecord) -> Result<()> {
        let switched = self.with_state(|state| {
            if state.targets.is_active(&record.id) {
                return None;
            }
            let outgoing = leave_active(state);
            state.detach_live();
            state.targets.bind(record.clone());
            state.reset_view();
            let guard = state.guard()?;
            Some((guard, outgoing))
        });
        let Some((guard, outgoing)) = switched else {
            tracing::debug!(context = %record.id, "already active");
            return Ok(());
        };
        tracing::info!(context = %record.id, kind = record.kind.label(), "switched context");

        let loaded = self.rehydrate(&guard, record.kind).await;
        self.schedule_refetch(guard, record.kind);
        if let Some((outgoing, had_user_turn)) = outgoing {
            if should_auto_title(&outgoing, had_user_turn) {
                self.spawn_auto_title(outgoing);
            }
        }
        loaded.map(|_| ())
    }

    /// Leaves the active context and activates `kind` with nothing bound;
    /// the next message creates a fresh context.
    ///
    /// Title generation for the context being left finishes before this
    /// returns.
    pub async fn new_context(&self, kind: ContextKind) {
        let outgoing = self.with_state(|state| {
            let outgoing = leave_active(state);
            state.detach_live();
            state.targets.clear(kind);
            state.reset_view();
            outgoing
        });
        tracing::info!(kind = kind.label(), "started new context");

        if let Some((outgoing, had_user_turn)) = outgoing {
            if should_auto_title(&outgoing, had_user_turn) {
                self.auto_title(outgoing).await;
            }
        }
    }

    pub async fn list_contexts(&self, kind: ContextKind) -> Result<Vec<ContextRecord>> {
        self.backend.list_contexts(kind).await
    }

    pub async fn rename_context(&self, kind: ContextKind, id: &ContextId, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            bail!("title must not be empty");
        }
        let first_rename = self.with_state(|state| state.renamed.insert(id.clone()));
        if let Err(error) = self.backend.rename_context(kind, id, title).await {
            if first_rename {
                self.with_state(|state| state.renamed.remove(id));
            }
            return Err(error);
        }
        self.apply_title(id, title);
        Ok(())
    }

    /// Deletes on the server, then unbinds the context if it was selected.
    pub async fn delete_context(&self, kind: ContextKind, id: &ContextId) -> Result<()> {
        self.backend.delete_context(kind, id).await?;
        self.with_state(|state| {
            if state.targets.is_active(id) {
                state.detach_live();
                state.targets.clear(kind);
                state.reset_view();
            } else {
                state.targets.forget(id);
            }
        });
        tracing::info!(context = %id, kind = kind.label(), "deleted context");
        Ok(())
    }

    pub(super) fn apply_title(&self, id: &ContextId, title: &str) {
        self.with_state(|state| {
            state.targets.rename(id, title);
            state.emit(EngineUpdate::TitleChanged {
                context: id.clone(),
                title: title.to_string(),
            });
        });
    }
}
