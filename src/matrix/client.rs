use crate::matrix::message::Message;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

/// Path prefix of the Matrix client-server API the bot talks to.
pub const DEFAULT_API_PREFIX: &str = "/_matrix/client/api/v1";

const EVENT_TYPE_MESSAGE: &str = "m.room.message";

/// Longest error body kept for logging.
const MAX_ERROR_BODY_CHARS: usize = 1024;

/// One call against a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `POST rooms/{room}/join`
    Join,
    /// `POST rooms/{room}/send/m.room.message`
    Send(Message),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Join => "join",
            Request::Send(_) => "send",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// 429 Too Many Requests. The only failure that is retried.
    #[error("Rate limited by homeserver")]
    RateLimited,
    /// Any other non-200 response.
    #[error("Homeserver returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// Connection, TLS or timeout failure. The URL is stripped because it
    /// carries the access token.
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Homeserver URL cannot hold a path: {0}")]
    InvalidUrl(String),
}

/// Thin client for the two homeserver endpoints the bot uses.
#[derive(Debug)]
pub struct HomeserverClient {
    http: reqwest::Client,
    base: Url,
    api_prefix: String,
    access_token: SecretString,
}

impl HomeserverClient {
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidUrl`] if `homeserver` does not parse or
    /// cannot carry a path (e.g. `mailto:`).
    pub fn new(
        http: reqwest::Client,
        homeserver: &str,
        api_prefix: &str,
        access_token: SecretString,
    ) -> Result<Self, DeliveryError> {
        let base = Url::parse(homeserver)
            .map_err(|e| DeliveryError::InvalidUrl(format!("{homeserver}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(DeliveryError::InvalidUrl(homeserver.to_string()));
        }

        Ok(Self {
            http,
            base,
            api_prefix: api_prefix.to_string(),
            access_token,
        })
    }

    /// Full request URL, including the `access_token` query parameter.
    ///
    /// Room ids are percent-encoded as a single path segment.
    pub fn endpoint(&self, room_id: &str, request: &Request) -> Result<Url, DeliveryError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DeliveryError::InvalidUrl(self.base.to_string()))?;
            segments
                .pop_if_empty()
                .extend(self.api_prefix.split('/').filter(|s| !s.is_empty()))
                .push("rooms")
                .push(room_id);
            match request {
                Request::Join => {
                    segments.push("join");
                }
                Request::Send(_) => {
                    segments.push("send").push(EVENT_TYPE_MESSAGE);
                }
            }
        }
        url.query_pairs_mut()
            .append_pair("access_token", self.access_token.expose_secret());
        Ok(url)
    }

    /// Performs one POST and classifies the response.
    pub async fn deliver(&self, room_id: &str, request: &Request) -> Result<(), DeliveryError> {
        let url = self.endpoint(room_id, request)?;
        let body = match request {
            Request::Join => "{}".to_string(),
            Request::Send(message) => serde_json::to_string(message)?,
        };

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.without_url()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::TOO_MANY_REQUESTS => Err(DeliveryError::RateLimited),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DeliveryError::HttpStatus {
                    status: status.as_u16(),
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                })
            }
        }
    }
}
