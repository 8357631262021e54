//! End-to-end tests: a feed server and a homeserver, both mocked, with a real
//! poller, seen store and delivery queue in between.
//!
//! Each test gets its own entry cache file under the system temp directory.

use matrix_rssbot::config::RoomMapping;
use matrix_rssbot::format::FormatStyle;
use matrix_rssbot::matrix::{DeliveryQueue, HomeserverClient, QueueOptions, DEFAULT_API_PREFIX};
use matrix_rssbot::poller::FeedPoller;
use matrix_rssbot::storage::SeenStore;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const ROOM: &str = "!news:example.org";
const SEND_PATH: &str = r"/rooms/[^/]+/send/m\.room\.message$";
const JOIN_PATH: &str = r"/rooms/[^/]+/join$";

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <item><title>Third</title><link>https://example.com/3</link><guid>3</guid></item>
  <item><title>Second</title><link>https://example.com/2</link><guid>2</guid></item>
  <item><title>First</title><link>https://example.com/1</link><guid>1</guid></item>
</channel></rss>"#;

fn cache_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "matrix-rssbot-it-{}-{}.txt",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

async fn feed_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

fn start_queue(homeserver: &MockServer) -> DeliveryQueue {
    let client = HomeserverClient::new(
        reqwest::Client::new(),
        &homeserver.uri(),
        DEFAULT_API_PREFIX,
        SecretString::from("secret-token".to_string()),
    )
    .unwrap();
    DeliveryQueue::start(
        client,
        QueueOptions {
            backoff_unit: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        },
    )
}

fn poller(feed: &MockServer, store: Arc<SeenStore>, queue: &DeliveryQueue) -> FeedPoller {
    FeedPoller::new(
        RoomMapping {
            room_id: ROOM.to_string(),
            feed_url: format!("{}/feed.xml", feed.uri()),
            format: FormatStyle::Text,
        },
        reqwest::Client::new(),
        store,
        queue.sender(),
        Duration::from_secs(60),
    )
}

/// Waits until the homeserver has seen `count` send requests.
async fn wait_for_sends(homeserver: &MockServer, count: usize) -> Vec<Request> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sends: Vec<Request> = homeserver
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path().ends_with("/send/m.room.message"))
            .collect();
        if sends.len() >= count {
            return sends;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {} messages arrived",
            sends.len(),
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn body_of(request: &Request) -> String {
    let json: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    json["body"].as_str().unwrap().to_string()
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_new_entries_delivered_oldest_first() {
    let feed = feed_server(FEED).await;
    let homeserver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(JOIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&homeserver)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(SEND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&homeserver)
        .await;

    let path = cache_path("order");
    let store = Arc::new(SeenStore::open(&path).await.unwrap());
    let queue = start_queue(&homeserver);

    assert_eq!(poller(&feed, store, &queue).poll_once().await.unwrap(), 3);

    let sends = wait_for_sends(&homeserver, 3).await;
    let bodies: Vec<String> = sends.iter().map(body_of).collect();
    assert_eq!(
        bodies,
        vec![
            "First - https://example.com/1",
            "Second - https://example.com/2",
            "Third - https://example.com/3",
        ]
    );

    let all = homeserver.received_requests().await.unwrap();
    assert!(all[0].url.path().ends_with("/join"));
    assert!(all
        .iter()
        .all(|r| r.url.query().unwrap_or_default().contains("access_token=secret-token")));

    queue.shutdown().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_rate_limited_send_is_retried() {
    let feed = feed_server(FEED).await;
    let homeserver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(JOIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&homeserver)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(SEND_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&homeserver)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(SEND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&homeserver)
        .await;

    let queue = start_queue(&homeserver);
    let store = Arc::new(SeenStore::in_memory());
    poller(&feed, store, &queue).poll_once().await.unwrap();

    // Three entries plus the one rejected attempt.
    let sends = wait_for_sends(&homeserver, 4).await;
    let mut delivered: Vec<String> = sends[1..].iter().map(body_of).collect();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![
            "First - https://example.com/1",
            "Second - https://example.com/2",
            "Third - https://example.com/3",
        ]
    );
    assert_eq!(queue.stats().rate_limited, 1);

    queue.shutdown().await;
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_does_not_repost() {
    let feed = feed_server(FEED).await;
    let homeserver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&homeserver)
        .await;

    let path = cache_path("restart");

    {
        let store = Arc::new(SeenStore::open(&path).await.unwrap());
        let queue = start_queue(&homeserver);
        assert_eq!(poller(&feed, store, &queue).poll_once().await.unwrap(), 3);
        wait_for_sends(&homeserver, 3).await;
        queue.shutdown().await;
    }

    let persisted = std::fs::read_to_string(&path).unwrap();
    assert_eq!(persisted.lines().collect::<Vec<_>>(), vec!["3", "2", "1"]);

    let store = Arc::new(SeenStore::open(&path).await.unwrap());
    assert_eq!(store.len().await, 3);
    let queue = start_queue(&homeserver);
    assert_eq!(poller(&feed, store, &queue).poll_once().await.unwrap(), 0);
    assert_eq!(queue.stats().depth, 0);

    queue.shutdown().await;
    let _ = std::fs::remove_file(&path);
}
