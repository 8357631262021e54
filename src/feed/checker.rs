use crate::feed::parser::{self, Item, ParseError};
use crate::storage::SeenStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that abort a single polling cycle.
///
/// Nothing is marked as seen when a check fails, so the next cycle picks up
/// the same entries again.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Anything other than 200 OK
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Document could not be parsed as a feed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Detects entries of one feed that have not been forwarded yet.
///
/// The checker itself is stateless; "already handled" lives entirely in the
/// shared [`SeenStore`], so a restart that reloads the store keeps skipping
/// old entries.
pub struct FeedChecker {
    url: String,
    client: reqwest::Client,
    store: Arc<SeenStore>,
}

impl FeedChecker {
    pub fn new(url: impl Into<String>, client: reqwest::Client, store: Arc<SeenStore>) -> Self {
        Self {
            url: url.into(),
            client,
            store,
        }
    }

    /// Fetches the feed and returns the entries not seen before.
    ///
    /// Entries come back in document order (usually newest first). Each one is
    /// marked seen as soon as it is selected, so it is never returned again by
    /// this or any other checker sharing the store.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] / [`FetchError::Timeout`] - the request failed
    /// - [`FetchError::HttpStatus`] - the server answered with anything but 200
    /// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`]
    /// - [`FetchError::Parse`] - the body is not a usable feed
    pub async fn check(&self) -> Result<Vec<Item>, FetchError> {
        let bytes = self.fetch().await?;
        let rss = parser::parse(&bytes)?;

        let total = rss.channel.items.len();
        let mut fresh = Vec::new();
        for item in rss.channel.items {
            if self.store.mark_if_new(&item.dedup_key()).await {
                fresh.push(item);
            }
        }

        tracing::debug!(
            feed = %self.url,
            total = total,
            new = fresh.len(),
            "Checked feed"
        );

        Ok(fresh)
    }

    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let response = tokio::time::timeout(FETCH_TIMEOUT, self.client.get(&self.url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, MAX_FEED_SIZE).await
    }
}

/// Reads the whole body, failing as soon as it exceeds `limit` bytes.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();
    if expected_length.is_some_and(|len| len > limit as u64) {
        return Err(FetchError::ResponseTooLarge);
    }

    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if body.len() + chunk.len() > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        body.extend_from_slice(&chunk);
    }

    match expected_length {
        Some(expected) if (body.len() as u64) < expected => Err(FetchError::IncompleteResponse {
            expected,
            received: body.len(),
        }),
        _ => Ok(body),
    }
}
