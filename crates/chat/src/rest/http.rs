use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatsync_transport::{BoxFuture, ConversationId};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::{
    AssistantId, ChatBackend, ConversationSummary, DecodeSnafu, NetworkSnafu, RemoteMessage,
    RestResult, StatusSnafu, UnauthorizedSnafu,
};

pub const CHATS_PATH: &str = "/api/rag/chats/";

/// Bearer credentials. Refreshing them is the caller's job.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenPair")
            .field("access", &redacted(&self.access))
            .field("refresh", &redacted(&self.refresh))
            .finish()
    }
}

fn redacted(token: &str) -> &'static str {
    if token.is_empty() { "<empty>" } else { "<redacted>" }
}

#[derive(Debug, Serialize)]
struct CreateChatRequest<'a> {
    name: &'a str,
    assistant: &'a AssistantId,
}

#[derive(Debug, Serialize)]
struct RenameChatRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatDetail {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
}

/// JSON-over-HTTP chat backend.
pub struct HttpChatBackend {
    client: reqwest::Client,
    api_base_url: String,
    tokens: Arc<ArcSwap<TokenPair>>,
}

impl HttpChatBackend {
    pub fn new(api_base_url: impl Into<String>, tokens: TokenPair) -> Self {
        Self::with_client(reqwest::Client::new(), api_base_url, tokens)
    }

    pub fn with_client(
        client: reqwest::Client,
        api_base_url: impl Into<String>,
        tokens: TokenPair,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into().trim().trim_end_matches('/').to_string(),
            tokens: Arc::new(ArcSwap::from_pointee(tokens)),
        }
    }

    pub fn tokens(&self) -> Arc<TokenPair> {
        self.tokens.load_full()
    }

    /// Swaps credentials for subsequent requests; in-flight requests keep the old ones.
    pub fn replace_tokens(&self, tokens: TokenPair) {
        self.tokens.store(Arc::new(tokens));
    }

    fn collection_url(&self) -> String {
        format!("{}{CHATS_PATH}", self.api_base_url)
    }

    fn conversation_url(&self, conversation_id: &ConversationId) -> String {
        format!("{}{CHATS_PATH}{conversation_id}/", self.api_base_url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let tokens = self.tokens.load();
        if tokens.access.is_empty() {
            builder
        } else {
            builder.bearer_auth(&tokens.access)
        }
    }

    async fn execute(
        &self,
        stage: &'static str,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> RestResult<Response> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .context(NetworkSnafu { stage, endpoint })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return UnauthorizedSnafu {
                stage,
                endpoint,
                status: status.as_u16(),
            }
            .fail();
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "chat backend request failed");
            return StatusSnafu {
                stage,
                endpoint,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        stage: &'static str,
        endpoint: &str,
        response: Response,
    ) -> RestResult<T> {
        response.json().await.context(DecodeSnafu { stage, endpoint })
    }

    async fn create(&self, assistant: &AssistantId, title: &str) -> RestResult<ConversationSummary> {
        let endpoint = self.collection_url();
        let request = self.client.post(&endpoint).json(&CreateChatRequest {
            name: title,
            assistant,
        });
        let response = self.execute("create-chat", &endpoint, request).await?;
        let summary: ConversationSummary = Self::decode("decode-created-chat", &endpoint, response).await?;
        tracing::info!(conversation_id = %summary.id, assistant = %assistant, "created conversation");
        Ok(summary)
    }

    async fn fetch(&self, conversation_id: &ConversationId) -> RestResult<Vec<RemoteMessage>> {
        let endpoint = self.conversation_url(conversation_id);
        let request = self.client.get(&endpoint);
        let response = self.execute("fetch-chat", &endpoint, request).await?;
        let detail: ChatDetail = Self::decode("decode-chat-detail", &endpoint, response).await?;
        Ok(detail.messages)
    }

    async fn rename(&self, conversation_id: &ConversationId, title: &str) -> RestResult<()> {
        let endpoint = self.conversation_url(conversation_id);
        let request = self
            .client
            .patch(&endpoint)
            .json(&RenameChatRequest { name: title });
        self.execute("rename-chat", &endpoint, request).await?;
        Ok(())
    }

    async fn delete(&self, conversation_id: &ConversationId) -> RestResult<()> {
        let endpoint = self.conversation_url(conversation_id);
        let request = self.client.delete(&endpoint);
        self.execute("delete-chat", &endpoint, request).await?;
        Ok(())
    }
}

impl ChatBackend for HttpChatBackend {
    fn create_conversation<'a>(
        &'a self,
        assistant: &'a AssistantId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<ConversationSummary>> {
        Box::pin(self.create(assistant, title))
    }

    fn fetch_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<Vec<RemoteMessage>>> {
        Box::pin(self.fetch(conversation_id))
    }

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<()>> {
        Box::pin(self.rename(conversation_id, title))
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<()>> {
        Box::pin(self.delete(conversation_id))
    }
}
