//! Integration tests for the harvest pipeline
//!
//! These tests use wiremock to stand in for mirror instances and run
//! full scheduler cycles end-to-end against an in-memory store.

use mirror_harvest::config::{FetcherConfig, PoolConfig, SchedulerConfig};
use mirror_harvest::{
    ContentFetcher, Event, EventBus, FetchOutcome, InstancePool, PostFilter, Scheduler,
    SqliteStore, TargetKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    scheduler: Scheduler,
    bus: EventBus,
    store: Arc<Mutex<SqliteStore>>,
    pool: InstancePool,
}

fn create_harness(instances: Vec<String>) -> Harness {
    let pool = InstancePool::spawn(&PoolConfig {
        instances,
        max_requests_per_minute: 60,
        backoff_base_seconds: 30,
        backoff_max_seconds: 600,
    });
    let fetcher = ContentFetcher::new(&FetcherConfig {
        user_agent: "mirror-harvest-test/1.0".to_string(),
        request_timeout_seconds: 5,
    })
    .expect("Failed to build fetcher");
    let store = Arc::new(Mutex::new(
        SqliteStore::new_in_memory().expect("Failed to open store"),
    ));
    let bus = EventBus::new();
    let scheduler = Scheduler::new(
        pool.clone(),
        fetcher,
        store.clone(),
        bus.clone(),
        SchedulerConfig::default(),
        None,
    );

    Harness {
        scheduler,
        bus,
        store,
        pool,
    }
}

/// Builds an RSS feed body; ids are newest-first, each with a distinct
/// pubDate so ordering is meaningful
fn rss_feed(user: &str, ids: &[u64]) -> String {
    let items: String = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            format!(
                r#"<item>
      <title>post {id} from {user}</title>
      <guid>https://upstream.example/{user}/status/{id}</guid>
      <link>https://upstream.example/{user}/status/{id}</link>
      <pubDate>Tue, 20 Aug 2024 16:{:02}:00 GMT</pubDate>
    </item>"#,
                59 - i
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>{user} / timeline</title>
    <link>https://upstream.example/{user}</link>
    <description>Posts from {user}</description>
    {items}
  </channel>
</rss>"#
    )
}

fn timeline_html(user: &str, ids: &[u64]) -> String {
    let items: String = ids
        .iter()
        .map(|id| {
            format!(
                r#"<div class="timeline-item">
      <a class="tweet-link" href="/{user}/status/{id}#m"></a>
      <span class="tweet-date"><a href="/{user}/status/{id}" title="Aug 20, 2024 · 4:15 PM UTC">Aug 20</a></span>
      <div class="tweet-content">page post {id} from {user}</div>
    </div>"#
            )
        })
        .collect();

    format!(r#"<html><body><div class="timeline">{items}</div></body></html>"#)
}

#[tokio::test]
async fn test_fetch_once_harvests_and_deduplicates() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/alice/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed("alice", &[103, 102, 101])))
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    let target = harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "alice", 300)
        .unwrap();

    let summary = harness.scheduler.fetch_once().await.unwrap();
    assert_eq!(summary.new_by_target.get("user:alice"), Some(&3));
    assert!(summary.failures.is_empty());

    // A second pass fetches the same feed but inserts nothing
    let summary = harness.scheduler.fetch_once().await.unwrap();
    assert_eq!(summary.new_by_target.get("user:alice"), Some(&0));
    assert!(summary.failures.is_empty());

    let store = harness.store.lock().unwrap();
    let posts = store.query(&PostFilter::default()).unwrap();
    assert_eq!(posts.len(), 3);
    // Newest first by created_at
    assert_eq!(posts[0].dedup_key, "103");

    // Fetch state tracks the newest post seen
    let target = store.get_target(target.id).unwrap().unwrap();
    assert_eq!(target.last_fetched_key.as_deref(), Some("103"));
    assert!(target.last_fetched_at.is_some());
}

#[tokio::test]
async fn test_html_fallback_when_feed_unparseable() {
    let mock_server = MockServer::start().await;

    // The feed endpoint answers 200 but with a non-feed body
    Mock::given(method("GET"))
        .and(path("/bob/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance page</html>"))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bob"))
        .respond_with(ResponseTemplate::new(200).set_body_string(timeline_html("bob", &[555])))
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "bob", 300)
        .unwrap();

    let summary = harness.scheduler.fetch_once().await.unwrap();
    assert_eq!(summary.new_by_target.get("user:bob"), Some(&1));
    assert!(summary.failures.is_empty());

    let posts = harness
        .store
        .lock()
        .unwrap()
        .query(&PostFilter {
            contains: Some("page post 555".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].dedup_key, "555");
}

#[tokio::test]
async fn test_hashtag_target_uses_search_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search/rss"))
        .and(query_param("f", "tweets"))
        .and(query_param("q", "#rustlang"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed("search", &[7, 6])))
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::Hashtag, "rustlang", 300)
        .unwrap();

    let summary = harness.scheduler.fetch_once().await.unwrap();
    assert_eq!(summary.new_by_target.get("hashtag:rustlang"), Some(&2));
    assert!(summary.failures.is_empty());
}

#[tokio::test]
async fn test_rate_limited_instance_is_reported_and_backed_off() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/carol/rss"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;

    // The fallback page must never be requested on a rate limit
    Mock::given(method("GET"))
        .and(path("/carol"))
        .respond_with(ResponseTemplate::new(200).set_body_string(timeline_html("carol", &[1])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "carol", 300)
        .unwrap();

    let summary = harness.scheduler.fetch_once().await.unwrap();
    assert_eq!(summary.new_by_target.get("user:carol"), Some(&0));
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].target, "user:carol");
    assert_eq!(summary.failures[0].instance.as_deref(), Some(mock_server.uri().as_str()));
    assert!(summary.failures[0].message.contains("429"));

    let snapshot = harness.pool.health_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].eligible);
    assert!(snapshot[0].backoff_remaining_seconds > 0);
}

#[tokio::test]
async fn test_partial_duplicate_batch_counts_only_new_rows() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gina/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed("gina", &[303, 302, 301])))
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    let target = harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "gina", 60)
        .unwrap();

    // One of the three feed posts is already stored
    harness
        .store
        .lock()
        .unwrap()
        .insert_posts(&[mirror_harvest::NewPost {
            dedup_key: "301".to_string(),
            target_id: target.id,
            content: "post 301 from gina".to_string(),
            created_at: None,
            source_instance: mock_server.uri(),
        }])
        .unwrap();

    let mut events = harness.bus.subscribe();
    let summary = harness.scheduler.fetch_once().await.unwrap();

    assert_eq!(summary.new_by_target.get("user:gina"), Some(&2));
    assert!(summary.failures.is_empty());
    assert_eq!(harness.store.lock().unwrap().count_posts().unwrap(), 3);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("No event published")
        .expect("Bus closed");
    assert!(matches!(event, Event::NewPost { count: 2, .. }));
}

#[tokio::test]
async fn test_fetch_once_isolates_rate_limited_target() {
    let mirror_a = MockServer::start().await;
    let mirror_b = MockServer::start().await;

    // One target is rate limited everywhere, the other works everywhere
    for server in [&mirror_a, &mirror_b] {
        Mock::given(method("GET"))
            .and(path("/heidi/rss"))
            .respond_with(ResponseTemplate::new(429))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ivan/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed("ivan", &[41, 40])))
            .mount(server)
            .await;
    }

    let harness = create_harness(vec![mirror_a.uri(), mirror_b.uri()]);
    {
        let mut store = harness.store.lock().unwrap();
        store.add_target(TargetKind::User, "heidi", 300).unwrap();
        store.add_target(TargetKind::User, "ivan", 300).unwrap();
    }

    let summary = harness.scheduler.fetch_once().await.unwrap();

    // heidi's rate limit is reported; ivan's harvest is unaffected
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].target, "user:heidi");
    assert!(summary.failures[0].message.contains("429"));
    assert_eq!(summary.new_by_target.get("user:heidi"), Some(&0));
    assert_eq!(summary.new_by_target.get("user:ivan"), Some(&2));
}

#[tokio::test]
async fn test_cooldown_when_no_instance_eligible() {
    let mock_server = MockServer::start().await;
    let harness = create_harness(vec![mock_server.uri()]);

    // Back the only instance off before the pass
    harness
        .pool
        .report(
            &mock_server.uri(),
            FetchOutcome::Error {
                message: "connect timeout".to_string(),
            },
        )
        .await;

    let target = harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "dave", 300)
        .unwrap();

    let mut events = harness.bus.subscribe();
    let summary = harness.scheduler.fetch_once().await.unwrap();

    // Not a failure, zero new posts
    assert_eq!(summary.new_by_target.get("user:dave"), Some(&0));
    assert!(summary.failures.is_empty());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("No event published")
        .expect("Bus closed");
    match event {
        Event::Cooldown {
            target_id,
            next_run_in_seconds,
        } => {
            assert_eq!(target_id, target.id);
            assert!((5..=15).contains(&next_run_in_seconds));
        }
        other => panic!("Expected cooldown event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_driver_cycle_publishes_events() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/erin/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss_feed("erin", &[22, 21])))
        .mount(&mock_server)
        .await;

    let harness = create_harness(vec![mock_server.uri()]);
    let target = harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "erin", 60)
        .unwrap();

    let mut events = harness.bus.subscribe();
    harness.scheduler.register_target(target.clone()).unwrap();

    // The first cycle runs immediately: new_post then tick
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("No event published")
        .expect("Bus closed");
    match event {
        Event::NewPost { target_id, count } => {
            assert_eq!(target_id, target.id);
            assert_eq!(count, 2);
        }
        other => panic!("Expected new_post event, got {:?}", other),
    }

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("No event published")
        .expect("Bus closed");
    assert!(matches!(event, Event::Tick { target_id } if target_id == target.id));

    assert!(harness.scheduler.cancel_target(target.id));
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_register_rejects_interval_below_minimum() {
    let mock_server = MockServer::start().await;
    let harness = create_harness(vec![mock_server.uri()]);

    let mut target = harness
        .store
        .lock()
        .unwrap()
        .add_target(TargetKind::User, "frank", 300)
        .unwrap();
    // Simulate a row edited out-of-band below the floor
    target.poll_interval_seconds = 10;

    assert!(harness.scheduler.register_target(target).is_err());
    assert_eq!(harness.scheduler.active_targets(), 0);
}
