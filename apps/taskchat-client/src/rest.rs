//! HTTP client for the REST fallback endpoints and `/health`.

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use taskchat_proto::{Action, ClientId, HealthReport, MessageBody, MessageRecord};
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

impl RestClient {
    pub fn new(base_url: Url, token: Option<String>) -> Result<Self, RestError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn with_token(&self, token: Option<String>) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }

    /// Resolves `segments` below the base url, keeping any base path prefix.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut path = self.base_url.path().trim_end_matches('/').to_string();
        for segment in segments {
            path.push('/');
            path.push_str(segment);
        }
        let mut url = self.base_url.clone();
        url.set_path(&path);
        Ok(url)
    }

    pub async fn health(&self) -> Result<HealthReport, RestError> {
        let url = self.endpoint(&["health"])?;
        let res = self.http.get(url).send().await?;
        read_json(res).await
    }

    pub async fn post_channel_message(
        &self,
        channel_id: i64,
        body: &MessageBody,
    ) -> Result<MessageRecord, RestError> {
        let url = self.endpoint(&["channels", &channel_id.to_string(), "messages"])?;
        let res = self.authorize(self.http.post(url)).json(body).send().await?;
        read_json(res).await
    }

    pub async fn edit_channel_message(
        &self,
        channel_id: i64,
        message_id: i64,
        body: &MessageBody,
    ) -> Result<MessageRecord, RestError> {
        let url = self.endpoint(&[
            "channels",
            &channel_id.to_string(),
            "messages",
            &message_id.to_string(),
        ])?;
        let res = self.authorize(self.http.patch(url)).json(body).send().await?;
        read_json(res).await
    }

    pub async fn send_direct_message(
        &self,
        recipient_id: i64,
        body: &MessageBody,
    ) -> Result<MessageRecord, RestError> {
        let url = self.endpoint(&["direct-messages", &recipient_id.to_string()])?;
        let res = self.authorize(self.http.post(url)).json(body).send().await?;
        read_json(res).await
    }

    /// Delivers a queued action over HTTP, returning the stored record.
    pub async fn deliver(
        &self,
        client_id: &ClientId,
        action: &Action,
    ) -> Result<MessageRecord, RestError> {
        let body = MessageBody {
            content: action.content().to_string(),
            mentions: action.mentions().to_vec(),
            client_id: Some(client_id.clone()),
            client_nonce: Some(action.nonce()),
        };
        match action {
            Action::SendChannelMessage(p) => self.post_channel_message(p.channel_id, &body).await,
            Action::EditChannelMessage(p) => {
                self.edit_channel_message(p.channel_id, p.message_id, &body)
                    .await
            }
            Action::SendDirectMessage(p) => self.send_direct_message(p.recipient_id, &body).await,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, RestError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(RestError::UnexpectedStatus { status, body })
    }
}
