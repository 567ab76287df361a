use crate::types::{ContextId, DocumentBody, DocumentId, Role};
use std::collections::HashSet;
use std::fmt;

/// Client-side identity of a message, stable for the lifetime of the turn and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalKey(u64);

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub local_key: LocalKey,
    pub server_document_id: Option<DocumentId>,
    pub role: Role,
    pub content: String,
    pub owner: ContextId,
    pub status: MessageStatus,
}

/// Ordered message log of the context currently on screen.
///
/// Every mutation names the context it was computed for and is dropped unless
/// that context still owns the log.
#[derive(Debug, Default)]
pub struct MessageStore {
    owner: Option<ContextId>,
    messages: Vec<Message>,
    next_key: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<&ContextId> {
        self.owner.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, key: LocalKey) -> Option<&Message> {
        self.messages.iter().find(|message| message.local_key == key)
    }

    /// Clears the log and hands it to `owner`. Keys keep counting so a key is
    /// never issued twice.
    pub fn reset(&mut self, owner: Option<ContextId>) {
        self.owner = owner;
        self.messages.clear();
    }

    /// Takes ownership of an unowned, empty log without clearing it.
    pub fn adopt(&mut self, owner: ContextId) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(owner);
        true
    }

    fn accepts(&self, context_id: &ContextId) -> bool {
        self.owner.as_ref() == Some(context_id)
    }

    fn issue_key(&mut self) -> LocalKey {
        self.next_key += 1;
        LocalKey(self.next_key)
    }

    pub fn begin_turn(
        &mut self,
        context_id: &ContextId,
        user_text: &str,
    ) -> Option<(LocalKey, LocalKey)> {
        if !self.accepts(context_id) {
            return None;
        }
        let user_key = self.issue_key();
        let assistant_key = self.issue_key();
        self.messages.push(Message {
            local_key: user_key,
            server_document_id: None,
            role: Role::User,
            content: user_text.to_string(),
            owner: context_id.clone(),
            status: MessageStatus::Complete,
        });
        self.messages.push(Message {
            local_key: assistant_key,
            server_document_id: None,
            role: Role::Assistant,
            content: String::new(),
            owner: context_id.clone(),
            status: MessageStatus::Streaming,
        });
        Some((user_key, assistant_key))
    }

    /// Replaces a streaming message's content with the cumulative `text`.
    ///
    /// Content only grows: text that is not an extension of what is shown is
    /// ignored. Returns the newly visible suffix when something changed.
    pub fn apply_delta(
        &mut self,
        context_id: &ContextId,
        key: LocalKey,
        text: &str,
    ) -> Option<String> {
        if !self.accepts(context_id) {
            return None;
        }
        let message = self.streaming_mut(key)?;
        if text.len() <= message.content.len() || !text.starts_with(message.content.as_str()) {
            return None;
        }
        let appended = text[message.content.len()..].to_string();
        message.content = text.to_string();
        Some(appended)
    }

    /// Attaches the server id. Content and local key are left untouched.
    pub fn finalize(
        &mut self,
        context_id: &ContextId,
        key: LocalKey,
        document_id: Option<DocumentId>,
    ) -> bool {
        if !self.accepts(context_id) {
            return false;
        }
        let Some(message) = self.streaming_mut(key) else {
            return false;
        };
        message.server_document_id = document_id;
        message.status = MessageStatus::Complete;
        true
    }

    /// Ends a streaming message with an inline error notice after whatever
    /// content already arrived.
    pub fn fail_turn(&mut self, context_id: &ContextId, key: LocalKey, notice: &str) -> bool {
        if !self.accepts(context_id) {
            return false;
        }
        let Some(message) = self.streaming_mut(key) else {
            return false;
        };
        if !message.content.is_empty() {
            message.content.push_str("\n\n");
        }
        message.content.push_str(notice);
        message.status = MessageStatus::Failed;
        true
    }

    /// Inserts history before the earliest message, keeping the batch order
    /// and skipping documents already present. Returns how many were added.
    pub fn prepend_older(
        &mut self,
        context_id: &ContextId,
        documents: Vec<DocumentBody>,
    ) -> Option<usize> {
        if !self.accepts(context_id) {
            return None;
        }
        let mut seen: HashSet<DocumentId> = self
            .messages
            .iter()
            .filter_map(|message| message.server_document_id.clone())
            .collect();

        let mut batch = Vec::with_capacity(documents.len());
        for document in documents {
            if !seen.insert(document.id.clone()) {
                continue;
            }
            let local_key = self.issue_key();
            batch.push(from_document(local_key, context_id, document));
        }

        let added = batch.len();
        self.messages.splice(0..0, batch);
        Some(added)
    }

    /// Swaps the whole log for a freshly fetched window.
    pub fn replace_with_history(
        &mut self,
        context_id: &ContextId,
        documents: Vec<DocumentBody>,
    ) -> bool {
        if !self.accepts(context_id) {
            return false;
        }
        self.messages.clear();
        self.prepend_older(context_id, documents).is_some()
    }

    pub fn earliest_document_id(&self) -> Option<&DocumentId> {
        self.messages
            .iter()
            .find_map(|message| message.server_document_id.as_ref())
    }

    pub fn last_document_id(&self) -> Option<&DocumentId> {
        self.messages
            .last()
            .and_then(|message| message.server_document_id.as_ref())
    }

    pub fn has_user_turn(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.role == Role::User)
    }

    pub fn is_streaming(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.status == MessageStatus::Streaming)
    }

    fn streaming_mut(&mut self, key: LocalKey) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.local_key == key)
            .filter(|message| message.status == MessageStatus::Streaming)
    }
}

fn from_document(local_key: LocalKey, owner: &ContextId, document: DocumentBody) -> Message {
    Message {
        local_key,
        server_document_id: Some(document.id),
        role: document.role,
        content: document.content,
        owner: owner.clone(),
        status: MessageStatus::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, role: Role, content: &str) -> DocumentBody {
        DocumentBody {
            id: DocumentId::new(id),
            role,
            content: content.to_string(),
            created_at: None,
        }
    }

    fn owned_store(id: &str) -> (MessageStore, ContextId) {
        let context = ContextId::new(id);
        let mut store = MessageStore::new();
        store.reset(Some(context.clone()));
        (store, context)
    }

    #[test]
    fn test_begin_turn_appends_user_and_empty_assistant() {
        let (mut store, context) = owned_store("c1");
        let (user_key, assistant_key) = store.begin_turn(&context, "hello").expect("turn");
        assert_ne!(user_key, assistant_key);

        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.is_empty());
        assert_eq!(messages[1].status, MessageStatus::Streaming);
    }

    #[test]
    fn test_mutations_for_other_context_are_dropped() {
        let (mut store, context) = owned_store("c1");
        let (_, assistant_key) = store.begin_turn(&context, "hello").expect("turn");
        let other = ContextId::new("c2");

        assert!(store.begin_turn(&other, "nope").is_none());
        assert!(store.apply_delta(&other, assistant_key, "leak").is_none());
        assert!(!store.finalize(&other, assistant_key, None));
        assert!(store.prepend_older(&other, vec![]).is_none());
        assert_eq!(store.len(), 2);
        assert!(store.messages()[1].content.is_empty());
    }

    #[test]
    fn test_apply_delta_is_monotonic() {
        let (mut store, context) = owned_store("c1");
        let (_, key) = store.begin_turn(&context, "hi").expect("turn");

        assert_eq!(store.apply_delta(&context, key, "Hel").as_deref(), Some("Hel"));
        assert_eq!(
            store.apply_delta(&context, key, "Hello").as_deref(),
            Some("lo")
        );
        // Stale or diverging cumulative text never shrinks the message.
        assert!(store.apply_delta(&context, key, "He").is_none());
        assert!(store.apply_delta(&context, key, "Jello!").is_none());
        assert_eq!(store.get(key).map(|m| m.content.as_str()), Some("Hello"));
    }

    #[test]
    fn test_finalize_keeps_content_and_key() {
        let (mut store, context) = owned_store("c1");
        let (_, key) = store.begin_turn(&context, "hi").expect("turn");
        store.apply_delta(&context, key, "Hi there");

        assert!(store.finalize(&context, key, Some(DocumentId::new("d1"))));
        let message = store.get(key).expect("message");
        assert_eq!(message.content, "Hi there");
        assert_eq!(message.local_key, key);
        assert_eq!(message.server_document_id, Some(DocumentId::new("d1")));
        assert_eq!(message.status, MessageStatus::Complete);

        // A finalized message no longer accepts deltas.
        assert!(store.apply_delta(&context, key, "Hi there!").is_none());
    }

    #[test]
    fn test_fail_turn_keeps_partial_content() {
        let (mut store, context) = owned_store("c1");
        let (_, key) = store.begin_turn(&context, "hi").expect("turn");
        store.apply_delta(&context, key, "Partial");
        assert!(store.fail_turn(&context, key, "[error] connection reset"));

        let message = store.get(key).expect("message");
        assert_eq!(message.content, "Partial\n\n[error] connection reset");
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[test]
    fn test_prepend_older_dedupes_and_keeps_batch_order() {
        let (mut store, context) = owned_store("c1");
        store.prepend_older(
            &context,
            vec![doc("3", Role::User, "c"), doc("4", Role::Assistant, "d")],
        );

        let added = store
            .prepend_older(
                &context,
                vec![
                    doc("1", Role::User, "a"),
                    doc("2", Role::Assistant, "b"),
                    doc("3", Role::User, "c"),
                ],
            )
            .expect("owned");
        assert_eq!(added, 2);

        let ids: Vec<&str> = store
            .messages()
            .iter()
            .filter_map(|m| m.server_document_id.as_ref().map(DocumentId::as_str))
            .collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(store.earliest_document_id(), Some(&DocumentId::new("1")));
        assert_eq!(store.last_document_id(), Some(&DocumentId::new("4")));
    }

    #[test]
    fn test_local_keys_are_never_reused_after_reset() {
        let (mut store, context) = owned_store("c1");
        let (first_user, first_assistant) = store.begin_turn(&context, "one").expect("turn");
        store.reset(Some(context.clone()));
        let (second_user, second_assistant) = store.begin_turn(&context, "two").expect("turn");

        let keys = [first_user, first_assistant, second_user, second_assistant];
        let unique: HashSet<LocalKey> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_adopt_only_claims_unowned_log() {
        let mut store = MessageStore::new();
        assert!(store.adopt(ContextId::new("c1")));
        assert!(!store.adopt(ContextId::new("c2")));
        assert_eq!(store.owner(), Some(&ContextId::new("c1")));
    }
}
