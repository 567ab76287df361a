use super::state::ChatEngine;
use crate::api::Backend;
use crate::state::cursor::HistoryPager;
use crate::types::{ContextRecord, Role};
use anyhow::Result;

pub(super) fn should_auto_title(record: &ContextRecord, had_user_turn: bool) -> bool {
    had_user_turn && record.has_default_title()
}

impl<B: Backend> ChatEngine<B> {
    pub(super) fn spawn_auto_title(&self, record: ContextRecord) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.auto_title(record).await;
        });
    }

    /// Never fails the caller; problems are logged.
    pub(super) async fn auto_title(&self, record: ContextRecord) {
        match self.generate_title(&record).await {
            Ok(Some(title)) => {
                tracing::info!(context = %record.id, title = %title, "generated title");
            }
            Ok(None) => {
                tracing::debug!(context = %record.id, "no user input to title from");
            }
            Err(error) => {
                tracing::warn!(context = %record.id, "title generation failed: {error:#}");
            }
        }
    }

    async fn generate_title(&self, record: &ContextRecord) -> Result<Option<String>> {
        let history = HistoryPager::new(self.backend.as_ref(), record.kind, &record.id)
            .load_all(self.settings.page_size)
            .await?;
        let user_inputs: Vec<String> = history
            .into_iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .collect();
        if user_inputs.is_empty() {
            return Ok(None);
        }

        let title = self.backend.summarize_title(&user_inputs).await?;
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }

        // The user may have named it while the summary was running.
        if !self.with_state(|state| state.keeps_default_title(&record.id)) {
            tracing::debug!(context = %record.id, "renamed meanwhile; keeping user title");
            return Ok(None);
        }
        self.backend
            .rename_context(record.kind, &record.id, title)
            .await?;
        self.apply_title(&record.id, title);
        Ok(Some(title.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextId, ContextKind};

    #[test]
    fn test_should_auto_title_requires_default_title_and_user_turn() {
        let default = ContextRecord::new(
            ContextId::new("c1"),
            ContextKind::Conversation,
            ContextKind::Conversation.default_title(),
        );
        let untitled = ContextRecord::new(ContextId::new("w1"), ContextKind::Work, "");
        let named = ContextRecord::new(ContextId::new("c2"), ContextKind::Conversation, "Trip");

        assert!(should_auto_title(&default, true));
        assert!(should_auto_title(&untitled, true));
        assert!(!should_auto_title(&default, false));
        assert!(!should_auto_title(&named, true));
    }
}
