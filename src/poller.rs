//! Periodic feed polling.
//!
//! Each room mapping gets its own task that checks its feed on a fixed
//! interval and hands new entries, oldest first, to the delivery queue.
//! Tasks run independently; a slow or failing feed never delays another.

use crate::config::RoomMapping;
use crate::feed::{FeedChecker, FetchError};
use crate::format::format_entry;
use crate::matrix::QueueSender;
use crate::storage::SeenStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Poller for one (room, feed) mapping.
pub struct FeedPoller {
    mapping: RoomMapping,
    checker: FeedChecker,
    queue: QueueSender,
    interval: Duration,
}

impl FeedPoller {
    pub fn new(
        mapping: RoomMapping,
        client: reqwest::Client,
        store: Arc<SeenStore>,
        queue: QueueSender,
        interval: Duration,
    ) -> Self {
        let checker = FeedChecker::new(mapping.feed_url.clone(), client, store);
        Self {
            mapping,
            checker,
            queue,
            interval,
        }
    }

    /// Runs one polling cycle and returns how many entries were queued.
    ///
    /// Entries are queued oldest first. An entry that cannot be formatted is
    /// logged and skipped without affecting the rest of the cycle; it stays
    /// marked as seen.
    pub async fn poll_once(&self) -> Result<usize, FetchError> {
        let entries = self.checker.check().await?;

        let mut queued = 0;
        for entry in entries.iter().rev() {
            let messages = match format_entry(entry, self.mapping.format) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(
                        feed = %self.mapping.feed_url,
                        guid = %entry.guid,
                        error = %e,
                        "Skipping entry that could not be formatted"
                    );
                    continue;
                }
            };

            for message in messages {
                self.queue.send_message(&self.mapping.room_id, message);
            }
            queued += 1;
        }

        if queued > 0 {
            tracing::info!(
                feed = %self.mapping.feed_url,
                room = %self.mapping.room_id,
                entries = queued,
                "Queued new entries"
            );
        }
        Ok(queued)
    }

    /// Polls until `shutdown` flips to true or its sender is dropped.
    ///
    /// The first check happens immediately. Ticks missed while a slow check was
    /// running are skipped rather than bunched up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            feed = %self.mapping.feed_url,
            room = %self.mapping.room_id,
            interval_secs = self.interval.as_secs(),
            "Feed poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = timer.tick() => {}
            }

            tracing::debug!(feed = %self.mapping.feed_url, "Checking for new posts");
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        tracing::warn!(
                            feed = %self.mapping.feed_url,
                            error = %e,
                            "Feed check failed, will retry next interval"
                        );
                    }
                }
            }
        }

        tracing::debug!(feed = %self.mapping.feed_url, "Feed poller stopped");
    }
}

/// Starts one [`FeedPoller`] task per mapping.
pub fn spawn_pollers(
    mappings: &[RoomMapping],
    client: &reqwest::Client,
    store: &Arc<SeenStore>,
    queue: &QueueSender,
    interval: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    mappings
        .iter()
        .map(|mapping| {
            let poller = FeedPoller::new(
                mapping.clone(),
                client.clone(),
                Arc::clone(store),
                queue.clone(),
                interval,
            );
            tokio::spawn(poller.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatStyle;
    use crate::matrix::{DeliveryQueue, HomeserverClient, QueueOptions, DEFAULT_API_PREFIX};
    use secrecy::SecretString;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TWO_ITEMS: &str = r#"<rss version="2.0"><channel>
    <item><title>Newer</title><link>https://example.com/2</link><guid>2</guid></item>
    <item><title>Older</title><link>https://example.com/1</link><guid>1</guid></item>
</channel></rss>"#;

    /// A queue pointing at a homeserver nobody listens on.
    fn idle_queue() -> DeliveryQueue {
        let client = HomeserverClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            DEFAULT_API_PREFIX,
            SecretString::from("tok".to_string()),
        )
        .unwrap();
        DeliveryQueue::start(client, QueueOptions::default())
    }

    async fn feed_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    fn mapping(server: &MockServer, format: FormatStyle) -> RoomMapping {
        RoomMapping {
            room_id: "!room:example.org".into(),
            feed_url: format!("{}/rss", server.uri()),
            format,
        }
    }

    #[tokio::test]
    async fn test_poll_once_counts_new_entries() {
        let server = feed_server(TWO_ITEMS).await;
        let queue = idle_queue();
        let poller = FeedPoller::new(
            mapping(&server, FormatStyle::Text),
            reqwest::Client::new(),
            Arc::new(SeenStore::in_memory()),
            queue.sender(),
            Duration::from_secs(60),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unformattable_entries_skipped() {
        // Image style needs an <img> in the description; neither entry has one.
        let server = feed_server(TWO_ITEMS).await;
        let queue = idle_queue();
        let store = Arc::new(SeenStore::in_memory());
        let poller = FeedPoller::new(
            mapping(&server, FormatStyle::Image),
            reqwest::Client::new(),
            Arc::clone(&store),
            queue.sender(),
            Duration::from_secs(60),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert!(store.ask("1").await);
        assert!(store.ask("2").await);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let queue = idle_queue();
        let poller = FeedPoller::new(
            mapping(&server, FormatStyle::Text),
            reqwest::Client::new(),
            Arc::new(SeenStore::in_memory()),
            queue.sender(),
            Duration::from_secs(60),
        );

        assert!(matches!(
            poller.poll_once().await,
            Err(FetchError::HttpStatus(503))
        ));

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = feed_server(TWO_ITEMS).await;
        let queue = idle_queue();
        let poller = FeedPoller::new(
            mapping(&server, FormatStyle::Text),
            reqwest::Client::new(),
            Arc::new(SeenStore::in_memory()),
            queue.sender(),
            Duration::from_millis(20),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();

        assert!(server.received_requests().await.unwrap().len() >= 2);

        queue.shutdown().await;
    }
}
