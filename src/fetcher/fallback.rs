//! HTML timeline fallback parsing
//!
//! Strategy B: when an instance serves a body that is not a parsable
//! feed, the rendered timeline page is scraped instead. Mirrors render
//! one `.timeline-item` per post with the text under `.tweet-content`,
//! the permalink under `.tweet-link` and the timestamp in the title
//! attribute of the `.tweet-date` anchor.

use crate::storage::{NewPost, TargetRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use super::{status_id_from_link, synthetic_dedup_key};

/// Timestamp format used in the `.tweet-date` title attribute
const DATE_TITLE_FORMAT: &str = "%b %d, %Y · %I:%M %p UTC";

/// Scrapes a timeline page into normalized posts
///
/// Zero extracted items is treated as a parse failure: a page with no
/// recognizable timeline is indistinguishable from an error page.
pub fn parse_timeline_html(
    body: &str,
    target: &TargetRecord,
    source_instance: &str,
) -> Result<Vec<NewPost>, String> {
    let document = Html::parse_document(body);

    let item_selector = selector(".timeline-item")?;
    let content_selector = selector(".tweet-content")?;
    let link_selector = selector(".tweet-link")?;
    let date_selector = selector(".tweet-date a")?;

    let mut posts = Vec::new();
    for item in document.select(&item_selector) {
        let content = item
            .select(&content_selector)
            .next()
            .map(element_text)
            .unwrap_or_default();
        if content.is_empty() {
            continue;
        }

        let link = item
            .select(&link_selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .map(|href| href.to_string());

        let created_at = item
            .select(&date_selector)
            .next()
            .and_then(|el| el.value().attr("title"))
            .and_then(parse_date_title);

        let dedup_key = link
            .as_deref()
            .and_then(status_id_from_link)
            .or(link)
            .unwrap_or_else(|| synthetic_dedup_key(target.id, &content, created_at.as_ref()));

        posts.push(NewPost {
            dedup_key,
            target_id: target.id,
            content,
            created_at,
            source_instance: source_instance.to_string(),
        });
    }

    if posts.is_empty() {
        return Err("no timeline items found in page".to_string());
    }
    Ok(posts)
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css}: {e:?}"))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn parse_date_title(title: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(title.trim(), DATE_TITLE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
