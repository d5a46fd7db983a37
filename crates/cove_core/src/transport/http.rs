//! reqwest-backed [`RestTransport`].

use async_trait::async_trait;
use reqwest::multipart;

use cove_proto::api::{
    FetchKeyResponse, HistoryPage, MediaUpload, PublishKeyRequest, SubmitMessageRequest,
    SubmitMessageResponse,
};

use super::{RestTransport, TransportError};

/// REST client for the fallback and multipart path.
#[derive(Clone)]
pub struct HttpRest {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpRest {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            bearer_token: None,
        })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(ref token) = self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("{status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl RestTransport for HttpRest {
    async fn submit(
        &self,
        request: &SubmitMessageRequest,
        media: &[MediaUpload],
    ) -> Result<SubmitMessageResponse, TransportError> {
        let builder = self.request(reqwest::Method::POST, "/messages");

        let response = if media.is_empty() {
            builder
                .json(request)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?
        } else {
            let payload = serde_json::to_string(request)
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            let mut form = multipart::Form::new().text("message", payload);
            for item in media {
                let part = multipart::Part::bytes(item.bytes.clone())
                    .file_name(item.filename.clone())
                    .mime_str(&item.mime_type)
                    .map_err(|e| TransportError::Http(e.to_string()))?;
                form = form.part("media", part);
            }
            builder
                .multipart(form)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?
        };

        Self::check(response).await
    }

    async fn fetch_history(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage, TransportError> {
        let mut builder = self
            .request(
                reqwest::Method::GET,
                &format!("/conversations/{conversation_id}/messages"),
            )
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            builder = builder.query(&[("before", cursor)]);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::check(response).await
    }

    async fn publish_public_key(
        &self,
        request: &PublishKeyRequest,
    ) -> Result<(), TransportError> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!(
                    "/conversations/{}/keys/{}",
                    request.conversation_id, request.user_id
                ),
            )
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn fetch_public_key(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<FetchKeyResponse, TransportError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/conversations/{conversation_id}/keys/{user_id}"),
            )
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::check(response).await
    }
}
