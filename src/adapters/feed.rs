//! RSS/Atom fetcher.
//!
//! Downloads a feed, picks out item links and image enclosures, and turns
//! every link not seen before into summarize work and every image into
//! analyze-image work. Article extraction happens downstream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::{ConfigError, FetchError};
use crate::ingest::{FetchOutcome, Fetcher, FollowUp};
use crate::queue::QueueName;
use crate::scheduler::source::Source;
use crate::store::Database;

/// Image URLs containing any of these are site chrome, not content.
const JUNK_IMAGE_KEYWORDS: &[&str] = &[
    "logo", "icon", "share", "social", "button", "badge", "avatar", "profile", "tracker", "pixel",
    "ad-", "banner",
];

/// One `<item>` or `<entry>` of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub link: String,
    pub images: Vec<String>,
}

struct FeedPatterns {
    entry: Regex,
    link_text: Regex,
    link_href: Regex,
    enclosure: Regex,
    media: Regex,
    attribute: Regex,
}

impl FeedPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            entry: Regex::new(r"(?is)<(item|entry)\b[^>]*>(.*?)</(?:item|entry)>")?,
            link_text: Regex::new(r"(?is)<link\b[^>]*>\s*(.*?)\s*</link>")?,
            link_href: Regex::new(r#"(?is)<(?:atom:)?link\b[^>]*?href\s*=\s*["']([^"']+)["']"#)?,
            enclosure: Regex::new(r#"(?is)<enclosure\b([^>]*)>"#)?,
            media: Regex::new(
                r#"(?is)<media:(?:content|thumbnail)\b[^>]*?\surl\s*=\s*["']([^"']+)["']"#,
            )?,
            attribute: Regex::new(r#"(?s)(?:^|\s)([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    /// Links and images repeated within one document are kept once, at their
    /// first occurrence.
    fn parse(&self, body: &str) -> Vec<FeedEntry> {
        let mut entries = Vec::new();
        let mut seen_links = HashSet::new();
        let mut seen_images = HashSet::new();

        for caps in self.entry.captures_iter(body) {
            let inner = &caps[2];

            let link = self
                .link_text
                .captures(inner)
                .map(|c| clean_text(&c[1]))
                .filter(|l| !l.is_empty())
                .or_else(|| self.link_href.captures(inner).map(|c| clean_text(&c[1])));
            let Some(link) = link.filter(|l| l.starts_with("http")) else {
                continue;
            };
            if !seen_links.insert(link.clone()) {
                continue;
            }

            let mut images = Vec::new();
            for enc in self.enclosure.captures_iter(inner) {
                let attrs = &enc[1];
                if let Some(url) = self.attr(attrs, "url") {
                    let is_image = self.attr(attrs, "type").is_none_or(|t| t.starts_with("image/"));
                    if is_image {
                        images.push(url);
                    }
                }
            }
            for media in self.media.captures_iter(inner) {
                images.push(clean_text(&media[1]));
            }
            images.retain(|url| is_content_image(url) && seen_images.insert(url.clone()));

            entries.push(FeedEntry { link, images });
        }

        entries
    }

    /// Value of the attribute called exactly `name` inside a tag's attribute
    /// text, single- or double-quoted.
    fn attr(&self, attrs: &str, name: &str) -> Option<String> {
        self.attribute
            .captures_iter(attrs)
            .find(|c| c[1].eq_ignore_ascii_case(name))
            .and_then(|c| c.get(2).or_else(|| c.get(3)))
            .map(|value| clean_text(value.as_str()))
    }
}

/// Strip CDATA wrappers and decode the entities that show up in feed URLs.
fn clean_text(raw: &str) -> String {
    let trimmed = raw.trim();
    let unwrapped = trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(trimmed);
    unwrapped
        .trim()
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn is_content_image(url: &str) -> bool {
    let lower = url.to_lowercase();
    if lower.starts_with("data:") || lower.contains(".svg") || lower.contains(".gif") {
        return false;
    }
    !JUNK_IMAGE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Fetches RSS/Atom sources over HTTP.
pub struct FeedFetcher {
    client: reqwest::Client,
    db: Arc<dyn Database>,
    patterns: FeedPatterns,
    timeout: Duration,
}

impl FeedFetcher {
    pub fn new(db: Arc<dyn Database>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "feed http client".into(),
                message: e.to_string(),
            })?;
        let patterns = FeedPatterns::new().map_err(|e| ConfigError::InvalidValue {
            key: "feed patterns".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            db,
            patterns,
            timeout,
        })
    }

    /// Parse a feed document without fetching it.
    pub fn parse(&self, body: &str) -> Vec<FeedEntry> {
        self.patterns.parse(body)
    }

    async fn download(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        resp.text().await.map_err(|e| FetchError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn is_known(&self, queue: &QueueName, payload_ref: &str) -> bool {
        // An unreadable dedup check errs on the side of enqueueing again.
        self.db.has_payload(queue, payload_ref).await.unwrap_or(false)
    }
}

#[async_trait]
impl Fetcher for FeedFetcher {
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, FetchError> {
        let body = self.download(&source.url).await?;
        let entries = self.patterns.parse(&body);
        debug!(source_id = source.id, entries = entries.len(), "Feed parsed");

        let mut outcome = FetchOutcome::default();
        for entry in entries {
            if self.is_known(&QueueName::SUMMARIZE, &entry.link).await {
                continue;
            }
            outcome.new_items += 1;
            outcome
                .follow_ups
                .push(FollowUp::new(QueueName::SUMMARIZE, entry.link));

            for image in entry.images {
                if !self.is_known(&QueueName::ANALYZE_IMAGE, &image).await {
                    outcome
                        .follow_ups
                        .push(FollowUp::new(QueueName::ANALYZE_IMAGE, image));
                }
            }
        }

        Ok(outcome)
    }
}
