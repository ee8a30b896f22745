//! REST implementation of the collaborator contracts.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  /conversations?user={id}&page={n}&page_size={n}`
//! - `GET  /conversations/{id}/messages?page={n}&page_size={n}` (page 0 = newest)
//! - `POST /conversations/{id}/messages`
//! - `GET  /users/{id}`

use async_trait::async_trait;
use serde::Deserialize;

use parley_shared::types::{Conversation, ConversationId, Message, UserId, UserProfile};

use crate::services::{
    ConversationDirectory, DirectoryPage, HistoryPage, MessageHistory, MessageSubmission,
    ServiceError, ServiceResult, UserDirectory,
};

/// HTTP client for the backend REST API, authenticated with the session
/// bearer token.
pub struct HttpServices {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpServices {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            auth_token: auth_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ServiceResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.auth_token)
            .query(query)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ServiceResult<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        ServiceError::Transport(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    conversations: Vec<Conversation>,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<Message>,
    has_more: bool,
}

#[derive(Debug, serde::Serialize)]
struct SubmitRequest<'a> {
    content: &'a str,
}

#[async_trait]
impl ConversationDirectory for HttpServices {
    async fn list_conversations(
        &self,
        user: &UserId,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<DirectoryPage> {
        let response: ConversationsResponse = self
            .get_json(
                "/conversations",
                &[
                    ("user", user.to_string()),
                    ("page", page.to_string()),
                    ("page_size", page_size.to_string()),
                ],
            )
            .await?;
        Ok(DirectoryPage {
            conversations: response.conversations,
            has_more: response.has_more,
        })
    }
}

#[async_trait]
impl MessageHistory for HttpServices {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<HistoryPage> {
        let response: MessagesResponse = self
            .get_json(
                &format!("/conversations/{conversation}/messages"),
                &[
                    ("page", page.to_string()),
                    ("page_size", page_size.to_string()),
                ],
            )
            .await?;
        Ok(HistoryPage {
            messages: response.messages,
            has_more: response.has_more,
        })
    }
}

#[async_trait]
impl MessageSubmission for HttpServices {
    async fn submit_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> ServiceResult<Message> {
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation}/messages")))
            .bearer_auth(&self.auth_token)
            .json(&SubmitRequest { content })
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl UserDirectory for HttpServices {
    async fn lookup_user(&self, user: &UserId) -> ServiceResult<UserProfile> {
        self.get_json(&format!("/users/{user}"), &[]).await
    }
}
