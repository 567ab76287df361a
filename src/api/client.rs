use super::logging::{debug_payload_enabled, emit_debug_payload};
use super::{Backend, ByteStream};
use crate::config::Config;
use crate::types::{
    ContextId, ContextKind, ContextRecord, DocumentBody, DocumentId, TurnRequest,
};
use crate::util::is_local_endpoint_url;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

const CONTEXT_LIST_PAGE_SIZE: usize = 50;

/// HTTP implementation of [`Backend`].
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    user_id: String,
}

#[derive(Deserialize)]
struct RemoteContext {
    id: ContextId,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct ContextList {
    #[serde(default, alias = "works")]
    conversations: Vec<RemoteContext>,
}

#[derive(Deserialize)]
struct IdList {
    #[serde(default)]
    ids: Vec<DocumentId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentEnvelope {
    Wrapped { document: DocumentBody },
    Bare(DocumentBody),
}

#[derive(Deserialize)]
struct TitleResponse {
    title: String,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            user_id: config.user_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.header("authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        request_url: &str,
    ) -> Result<reqwest::Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|error| map_api_request_error(error, request_url))?
            .error_for_status()
            .map_err(|error| map_api_request_error(error, request_url))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        request_url: &str,
    ) -> Result<T> {
        let response = self.execute(request, request_url).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| anyhow!("invalid response from '{request_url}': {error}"))
    }

    fn post_json(&self, request_url: &str, payload: &Value) -> reqwest::RequestBuilder {
        if debug_payload_enabled() {
            emit_debug_payload(request_url, payload);
        }
        self.http
            .post(request_url)
            .header("content-type", "application/json")
            .json(payload)
    }
}

impl Backend for ApiClient {
    async fn create_context(&self, kind: ContextKind) -> Result<ContextRecord> {
        let (request_url, payload) = match kind {
            ContextKind::Conversation => (
                self.url("conversations/new"),
                json!({ "user_id": self.user_id }),
            ),
            ContextKind::Work => (
                self.url("works"),
                json!({ "user_id": self.user_id, "title": kind.default_title() }),
            ),
        };
        let created: RemoteContext = self
            .execute_json(self.post_json(&request_url, &payload), &request_url)
            .await?;
        Ok(into_record(created, kind))
    }

    async fn list_contexts(&self, kind: ContextKind) -> Result<Vec<ContextRecord>> {
        let request_url = match kind {
            ContextKind::Conversation => self.url("conversations"),
            ContextKind::Work => self.url("works"),
        };
        let request = self.http.get(&request_url).query(&[
            ("user_id", self.user_id.clone()),
            ("page", "1".to_string()),
            ("page_size", CONTEXT_LIST_PAGE_SIZE.to_string()),
        ]);
        let list: ContextList = self.execute_json(request, &request_url).await?;
        Ok(list
            .conversations
            .into_iter()
            .map(|remote| into_record(remote, kind))
            .collect())
    }

    async fn rename_context(&self, kind: ContextKind, id: &ContextId, title: &str) -> Result<()> {
        let request_url = self.url(&format!("{}/{id}/title", collection(kind)));
        let payload = json!({ "user_id": self.user_id, "title": title });
        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }
        let request = self.http.put(&request_url).json(&payload);
        self.execute(request, &request_url).await?;
        Ok(())
    }

    async fn delete_context(&self, kind: ContextKind, id: &ContextId) -> Result<()> {
        let request_url = self.url(&format!("{}/{id}", collection(kind)));
        let request = self
            .http
            .delete(&request_url)
            .query(&[("user_id", self.user_id.as_str())]);
        self.execute(request, &request_url).await?;
        Ok(())
    }

    async fn list_message_ids(
        &self,
        kind: ContextKind,
        id: &ContextId,
        before: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<DocumentId>> {
        let request_url = self.url("documents/ids");
        let mut query = vec![
            (owner_param(kind), id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before_id", before.to_string()));
        }
        let request = self.http.get(&request_url).query(&query);
        let list: IdList = self.execute_json(request, &request_url).await?;
        Ok(list.ids)
    }

    async fn get_message(&self, kind: ContextKind, id: &DocumentId) -> Result<DocumentBody> {
        let request_url = match kind {
            ContextKind::Conversation => self.url(&format!("documents/{id}")),
            ContextKind::Work => self.url(&format!("work-documents/{id}")),
        };
        let request = self
            .http
            .get(&request_url)
            .query(&[("user_id", self.user_id.as_str())]);
        let envelope: DocumentEnvelope = self.execute_json(request, &request_url).await?;
        Ok(match envelope {
            DocumentEnvelope::Wrapped { document } => document,
            DocumentEnvelope::Bare(document) => document,
        })
    }

    async fn send_turn(&self, request: &TurnRequest) -> Result<ByteStream> {
        let request_url = self.url("chat");
        let payload = chat_payload(request, &self.user_id);
        let response = self
            .execute(self.post_json(&request_url, &payload), &request_url)
            .await?;

        let request_url_for_stream = request_url.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_api_request_error(error, &request_url_for_stream))
        });
        Ok(Box::pin(stream))
    }

    async fn summarize_title(&self, user_texts: &[String]) -> Result<String> {
        let request_url = self.url("conversations/generate-title");
        let payload = json!({ "user_id": self.user_id, "user_inputs": user_texts });
        let response: TitleResponse = self
            .execute_json(self.post_json(&request_url, &payload), &request_url)
            .await?;
        Ok(response.title)
    }
}

fn into_record(remote: RemoteContext, kind: ContextKind) -> ContextRecord {
    ContextRecord::new(remote.id, kind, remote.title)
}

fn collection(kind: ContextKind) -> &'static str {
    match kind {
        ContextKind::Conversation => "conversations",
        ContextKind::Work => "works",
    }
}

fn owner_param(kind: ContextKind) -> &'static str {
    match kind {
        ContextKind::Conversation => "conversation_id",
        ContextKind::Work => "work_id",
    }
}

fn chat_payload(request: &TurnRequest, user_id: &str) -> Value {
    let mut payload = json!({
        "model": request.model,
        "user_id": user_id,
        "messages": [{ "role": "user", "content": request.user_text }],
    });
    if let (Some(context_id), Some(object)) = (&request.context_id, payload.as_object_mut()) {
        object.insert(
            owner_param(request.kind).to_string(),
            Value::String(context_id.to_string()),
        );
    }
    payload
}

fn map_api_request_error(error: reqwest::Error, request_url: &str) -> anyhow::Error {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return anyhow!(
            "cannot reach local backend '{}': {}. Start the server or update QUILL_API_URL.",
            request_url,
            error
        );
    }
    if error.is_connect() {
        return anyhow!("cannot reach backend '{}': {}", request_url, error);
    }
    if error.is_timeout() {
        return anyhow!("request to '{}' timed out: {}", request_url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!(
            "backend '{}' returned HTTP {}: {}",
            request_url,
            status,
            error
        );
    }
    anyhow!("request to '{}' failed: {}", request_url, error)
}
