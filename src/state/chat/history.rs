use super::state::{ChatEngine, EngineUpdate, ViewGuard};
use crate::api::Backend;
use crate::error::{EngineError, Fault};
use crate::state::cursor::{HistoryPage, HistoryPager};
use crate::types::ContextKind;
use anyhow::Result;

impl<B: Backend> ChatEngine<B> {
    /// Prepends the next older page of the active context. Returns how many
    /// messages were added; zero once the first message is on screen.
    pub async fn load_older(&self) -> Result<usize> {
        let (guard, kind, before_id) = self.with_state(|state| {
            let guard = state.guard().ok_or(EngineError::NoActiveContext)?;
            let kind = state.targets.active_kind();
            let before_id = if state.cursor.has_more {
                state.cursor.before_id.clone()
            } else {
                None
            };
            Ok::<_, EngineError>((guard, kind, before_id))
        })?;
        let Some(before_id) = before_id else {
            return Ok(0);
        };

        let page = HistoryPager::new(self.backend.as_ref(), kind, &guard.context)
            .load_older(&before_id, self.settings.page_size)
            .await?;
        report_faults(&page);

        Ok(self.with_state(|state| {
            // A concurrent load already moved the cursor past this page.
            if !state.holds(&guard) || state.cursor.before_id.as_ref() != Some(&before_id) {
                state.drop_stale(&guard);
                return 0;
            }
            let added = state
                .store
                .prepend_older(&guard.context, page.messages)
                .unwrap_or(0);
            state.cursor.advance(&page.ids);
            let has_more = state.cursor.has_more;
            state.emit(EngineUpdate::HistoryPrepended {
                count: added,
                has_more,
            });
            added
        }))
    }

    /// Loads the latest page into a freshly reset view. Turns sent to this
    /// view wait until the page is in.
    pub(super) async fn rehydrate(&self, guard: &ViewGuard, kind: ContextKind) -> Result<usize> {
        let loaded = HistoryPager::new(self.backend.as_ref(), kind, &guard.context)
            .load_latest(self.settings.page_size)
            .await;

        let added: Result<usize> = self.with_state(|state| {
            state.finish_hydration(guard);
            let page = loaded?;
            report_faults(&page);
            if !state.holds(guard) {
                state.drop_stale(guard);
                return Ok(0);
            }
            let added = state
                .store
                .prepend_older(&guard.context, page.messages)
                .unwrap_or(0);
            state.cursor.advance(&page.ids);
            let has_more = state.cursor.has_more;
            state.emit(EngineUpdate::HistoryPrepended {
                count: added,
                has_more,
            });
            Ok(added)
        });
        self.hydrated.notify_waiters();
        added
    }

    /// Re-reads the latest page after `refetch_delay` to pick up a reply the
    /// server finished after the user last looked.
    pub(super) fn schedule_refetch(&self, guard: ViewGuard, kind: ContextKind) {
        let delay = self.settings.refetch_delay;
        if delay.is_zero() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.refetch_if_changed(&guard, kind).await {
                Ok(true) => tracing::info!(context = %guard.context, "refreshed log after re-read"),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(context = %guard.context, "re-read failed: {error:#}");
                }
            }
        });
    }

    pub(super) async fn refetch_if_changed(
        &self,
        guard: &ViewGuard,
        kind: ContextKind,
    ) -> Result<bool> {
        if !self.with_state(|state| state.holds(guard)) {
            return Ok(false);
        }

        let page = HistoryPager::new(self.backend.as_ref(), kind, &guard.context)
            .load_latest(self.settings.page_size)
            .await?;
        if !page.faults.is_empty() {
            report_faults(&page);
            return Ok(false);
        }

        Ok(self.with_state(|state| {
            if !state.holds(guard) {
                state.drop_stale(guard);
                return false;
            }
            if state.is_streaming(&guard.context) {
                return false;
            }

            let limit = state.cursor.limit;
            let changed = page.ids.last() != state.store.last_document_id()
                || (state.store.len() < limit && page.ids.len() != state.store.len());
            if !changed {
                return false;
            }

            let count = page.messages.len();
            state
                .store
                .replace_with_history(&guard.context, page.messages);
            state.cursor.reset();
            state.cursor.advance(&page.ids);
            state.emit(EngineUpdate::HistoryReplaced { count });
            true
        }))
    }
}

fn report_faults(page: &HistoryPage) {
    for fault in &page.faults {
        Fault::report(fault);
    }
}
