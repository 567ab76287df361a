pub mod client;
pub mod logging;
pub mod mock_client;
pub mod stream;

pub use client::ApiClient;

use crate::types::{ContextId, ContextKind, ContextRecord, DocumentBody, DocumentId, TurnRequest};
use anyhow::Result;
use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Calls the engine makes against the chat backend.
///
/// Every call is a suspension point; the engine re-validates the active
/// context after each one returns.
pub trait Backend: Send + Sync + 'static {
    fn create_context(
        &self,
        kind: ContextKind,
    ) -> impl Future<Output = Result<ContextRecord>> + Send;

    fn list_contexts(
        &self,
        kind: ContextKind,
    ) -> impl Future<Output = Result<Vec<ContextRecord>>> + Send;

    fn rename_context(
        &self,
        kind: ContextKind,
        id: &ContextId,
        title: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_context(
        &self,
        kind: ContextKind,
        id: &ContextId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ids oldest to newest. With `before`, only ids strictly preceding it.
    fn list_message_ids(
        &self,
        kind: ContextKind,
        id: &ContextId,
        before: Option<&DocumentId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DocumentId>>> + Send;

    fn get_message(
        &self,
        kind: ContextKind,
        id: &DocumentId,
    ) -> impl Future<Output = Result<DocumentBody>> + Send;

    fn send_turn(&self, request: &TurnRequest) -> impl Future<Output = Result<ByteStream>> + Send;

    fn summarize_title(&self, user_texts: &[String]) -> impl Future<Output = Result<String>> + Send;
}
