//! RSS feed parsing
//!
//! Strategy A: mirror instances expose timelines as RSS. Items are
//! normalized into `NewPost` records; the upstream status id (when one
//! can be recovered from the guid or link) becomes the dedup key.

use crate::storage::{NewPost, TargetRecord};
use chrono::{DateTime, Utc};
use rss::Channel;

use super::{status_id_from_link, synthetic_dedup_key};

/// Parses an RSS body into normalized posts
///
/// An empty channel is valid and yields zero posts. Returns Err only
/// when the body is not a parsable feed, which sends the caller to the
/// HTML fallback.
pub fn parse_feed(
    body: &str,
    target: &TargetRecord,
    source_instance: &str,
) -> Result<Vec<NewPost>, String> {
    let channel =
        Channel::read_from(body.as_bytes()).map_err(|e| format!("feed parse failed: {e}"))?;

    let mut posts = Vec::new();
    for item in channel.items() {
        let content = item
            .title()
            .or_else(|| item.description())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            continue;
        }

        let created_at = item.pub_date().and_then(parse_rfc2822);

        let guid = item.guid().map(|g| g.value().to_string());
        let link = item.link().map(|l| l.to_string());
        let dedup_key = guid
            .as_deref()
            .and_then(status_id_from_link)
            .or_else(|| link.as_deref().and_then(status_id_from_link))
            .or_else(|| guid.clone())
            .or_else(|| link.clone())
            .unwrap_or_else(|| synthetic_dedup_key(target.id, &content, created_at.as_ref()));

        posts.push(NewPost {
            dedup_key,
            target_id: target.id,
            content,
            created_at,
            source_instance: source_instance.to_string(),
        });
    }

    Ok(posts)
}

fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TargetKind;
    use chrono::TimeZone;

    fn create_test_target() -> TargetRecord {
        TargetRecord {
            id: 7,
            kind: TargetKind::User,
            value: "alice".to_string(),
            poll_interval_seconds: 300,
            last_fetched_key: None,
            last_fetched_at: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn feed_with_items(items: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>alice / timeline</title>
    <link>https://mirror.example/alice</link>
    <description>Posts from alice</description>
    {items}
  </channel>
</rss>"#
        )
    }

    #[test]
    fn test_parse_feed_extracts_posts() {
        let body = feed_with_items(
            r#"<item>
      <title>First post from alice</title>
      <guid>https://mirror.example/alice/status/1001</guid>
      <link>https://mirror.example/alice/status/1001</link>
      <pubDate>Tue, 20 Aug 2024 16:15:00 GMT</pubDate>
    </item>
    <item>
      <title>  Second post, needs trimming  </title>
      <guid>https://mirror.example/alice/status/1002</guid>
      <pubDate>Tue, 20 Aug 2024 17:00:00 GMT</pubDate>
    </item>"#,
        );

        let posts = parse_feed(&body, &create_test_target(), "https://mirror.example").unwrap();
        assert_eq!(posts.len(), 2);

        assert_eq!(posts[0].dedup_key, "1001");
        assert_eq!(posts[0].content, "First post from alice");
        assert_eq!(posts[0].target_id, 7);
        assert_eq!(posts[0].source_instance, "https://mirror.example");
        assert_eq!(
            posts[0].created_at,
            Some(Utc.with_ymd_and_hms(2024, 8, 20, 16, 15, 0).unwrap())
        );

        assert_eq!(posts[1].content, "Second post, needs trimming");
        assert_eq!(posts[1].dedup_key, "1002");
    }

    #[test]
    fn test_parse_feed_unparseable_date_is_none() {
        let body = feed_with_items(
            r#"<item>
      <title>post</title>
      <guid>https://m.example/alice/status/5</guid>
      <pubDate>sometime recently</pubDate>
    </item>"#,
        );

        let posts = parse_feed(&body, &create_test_target(), "https://m.example").unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].created_at.is_none());
    }

    #[test]
    fn test_parse_feed_falls_back_to_guid_then_synthetic() {
        let body = feed_with_items(
            r#"<item>
      <title>no status id anywhere</title>
      <guid>urn:opaque:abc</guid>
    </item>
    <item>
      <title>no guid and no link at all</title>
    </item>"#,
        );

        let posts = parse_feed(&body, &create_test_target(), "https://m.example").unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].dedup_key, "urn:opaque:abc");
        // Synthetic key: deterministic sha2 hex
        assert_eq!(posts[1].dedup_key.len(), 64);
        assert!(posts[1].dedup_key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_feed_skips_empty_items() {
        let body = feed_with_items(
            r#"<item>
      <title>   </title>
      <guid>https://m.example/alice/status/9</guid>
    </item>"#,
        );

        let posts = parse_feed(&body, &create_test_target(), "https://m.example").unwrap();
        assert!(posts.is_empty());
    }

    #[test]
    fn test_parse_feed_empty_channel_is_ok() {
        let body = feed_with_items("");
        let posts = parse_feed(&body, &create_test_target(), "https://m.example").unwrap();
        assert!(posts.is_empty());
    }

    #[test]
    fn test_parse_feed_rejects_non_feed_body() {
        let result = parse_feed(
            "<html><body>rate limit page</body></html>",
            &create_test_target(),
            "https://m.example",
        );
        assert!(result.is_err());
    }
}
