use crate::api::Backend;
use crate::error::Fault;
use crate::types::{ContextId, ContextKind, DocumentBody, DocumentId};
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;

/// Where the next older page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub before_id: Option<DocumentId>,
    pub limit: usize,
    pub has_more: bool,
}

impl PageCursor {
    pub fn new(limit: usize) -> Self {
        Self {
            before_id: None,
            limit: limit.max(1),
            has_more: false,
        }
    }

    pub fn reset(&mut self) {
        self.before_id = None;
        self.has_more = false;
    }

    /// Moves past a fetched page. A short page is the last one.
    pub fn advance(&mut self, page_ids: &[DocumentId]) {
        if let Some(first) = page_ids.first() {
            self.before_id = Some(first.clone());
        }
        self.has_more = !page_ids.is_empty() && page_ids.len() >= self.limit;
    }
}

/// One resolved page, bodies in id order with failed fetches left out.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub ids: Vec<DocumentId>,
    pub messages: Vec<DocumentBody>,
    pub has_more: bool,
    pub faults: Vec<Fault>,
}

/// Fetches history pages for a single context.
pub struct HistoryPager<'a, B> {
    backend: &'a B,
    kind: ContextKind,
    context_id: &'a ContextId,
}

impl<'a, B: Backend> HistoryPager<'a, B> {
    pub fn new(backend: &'a B, kind: ContextKind, context_id: &'a ContextId) -> Self {
        Self {
            backend,
            kind,
            context_id,
        }
    }

    pub async fn load_latest(&self, limit: usize) -> Result<HistoryPage> {
        let ids = self
            .backend
            .list_message_ids(self.kind, self.context_id, None, limit)
            .await?;
        Ok(self.resolve(ids, limit).await)
    }

    pub async fn load_older(&self, before_id: &DocumentId, limit: usize) -> Result<HistoryPage> {
        let ids = self
            .backend
            .list_message_ids(self.kind, self.context_id, Some(before_id), limit)
            .await?;
        Ok(self.resolve(ids, limit).await)
    }

    /// Walks back to the first message. Ids already seen on a later page are
    /// skipped; a page with nothing new in it ends the walk.
    pub async fn load_all(&self, limit: usize) -> Result<Vec<DocumentBody>> {
        let first = self.load_latest(limit).await?;
        report_all(&first.faults);

        let mut seen: HashSet<DocumentId> = first.ids.iter().cloned().collect();
        let mut before = first.ids.first().cloned();
        let mut has_more = first.has_more;
        let mut history = first.messages;

        while has_more {
            let Some(before_id) = before.take() else {
                break;
            };
            let page = self.load_older(&before_id, limit).await?;
            report_all(&page.faults);
            let fresh: HashSet<DocumentId> = page
                .ids
                .iter()
                .filter(|id| seen.insert((*id).clone()))
                .cloned()
                .collect();
            if fresh.is_empty() {
                break;
            }
            before = page.ids.first().cloned();
            has_more = page.has_more;
            let older = page
                .messages
                .into_iter()
                .filter(|message| fresh.contains(&message.id));
            history.splice(0..0, older);
        }
        Ok(history)
    }

    async fn resolve(&self, ids: Vec<DocumentId>, limit: usize) -> HistoryPage {
        let mut fetches: FuturesUnordered<_> = ids
            .iter()
            .enumerate()
            .map(|(index, id)| async move {
                (index, self.backend.get_message(self.kind, id).await)
            })
            .collect();

        let mut slots: Vec<Option<DocumentBody>> = vec![None; ids.len()];
        let mut faults = Vec::new();
        while let Some((index, result)) = fetches.next().await {
            match result {
                Ok(body) => slots[index] = Some(body),
                Err(error) => faults.push(Fault::Pagination {
                    id: ids[index].clone(),
                    reason: error.to_string(),
                }),
            }
        }
        drop(fetches);

        HistoryPage {
            has_more: !ids.is_empty() && ids.len() >= limit,
            messages: slots.into_iter().flatten().collect(),
            ids,
            faults,
        }
    }
}

fn report_all(faults: &[Fault]) {
    for fault in faults {
        fault.report();
    }
}
