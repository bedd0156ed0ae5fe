use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

use crate::config::{Config, FeedDefinition, FeedFormat};
use crate::storage::{Article, ArticleQuery, Database};
use crate::util::escape_html;

pub const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";
pub const ATOM_CONTENT_TYPE: &str = "application/atom+xml; charset=utf-8";

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const GENERATOR: &str = concat!("refeed ", env!("CARGO_PKG_VERSION"));

/// A rendered feed document and its HTTP content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFeed {
    pub content_type: &'static str,
    pub body: String,
}

/// Read the articles selected by `feed` and render them.
pub async fn build_feed(db: &Database, feed: &FeedDefinition) -> Result<RenderedFeed> {
    let articles = db
        .query_articles(&ArticleQuery {
            sources: feed.sources.clone(),
            categories: feed.categories.clone(),
            free_only: feed.free_only,
            limit: feed.max_items.min(Config::MAX_FEED_ITEMS),
        })
        .await
        .with_context(|| format!("Failed to load articles for feed '{}'", feed.name))?;

    render_feed(feed, &articles)
}

/// Render a feed document from already selected articles.
///
/// Pure: the output depends only on `feed` and `articles`. Items are ordered
/// by publication time descending, ties by URL ascending, and cut to
/// `max_items`. The document timestamp is the newest `last_updated` among
/// the rendered items.
pub fn render_feed(feed: &FeedDefinition, articles: &[Article]) -> Result<RenderedFeed> {
    let mut items: Vec<&Article> = articles.iter().collect();
    items.sort_by(|a, b| b.published.cmp(&a.published).then_with(|| a.url.cmp(&b.url)));
    items.truncate(feed.max_items.min(Config::MAX_FEED_ITEMS) as usize);

    let last_updated = items.iter().map(|a| a.last_updated).max();

    let (content_type, bytes) = match feed.format {
        FeedFormat::Rss => (RSS_CONTENT_TYPE, write_rss(feed, &items, last_updated)?),
        FeedFormat::Atom => (ATOM_CONTENT_TYPE, write_atom(feed, &items, last_updated)?),
    };

    let body = String::from_utf8(bytes).context("Generated feed contains invalid UTF-8")?;
    Ok(RenderedFeed { content_type, body })
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn new_writer() -> Result<XmlWriter> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;
    Ok(writer)
}

fn start(writer: &mut XmlWriter, element: BytesStart<'_>) -> Result<()> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    writer
        .write_event(Event::Start(element))
        .with_context(|| format!("Failed to write <{name}>"))
}

fn end(writer: &mut XmlWriter, name: &str) -> Result<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write </{name}>"))
}

/// `<name>text</name>`; the writer escapes `text`.
fn text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<()> {
    start(writer, BytesStart::new(name))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write <{name}> text"))?;
    end(writer, name)
}

fn empty_element(writer: &mut XmlWriter, element: BytesStart<'_>) -> Result<()> {
    writer
        .write_event(Event::Empty(element))
        .context("Failed to write empty element")
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================================
// RSS 2.0
// ============================================================================

fn write_rss(
    feed: &FeedDefinition,
    items: &[&Article],
    last_updated: Option<DateTime<Utc>>,
) -> Result<Vec<u8>> {
    let mut writer = new_writer()?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    start(&mut writer, rss)?;
    start(&mut writer, BytesStart::new("channel"))?;

    text_element(&mut writer, "title", &feed.title)?;
    text_element(&mut writer, "link", &feed.link)?;
    text_element(
        &mut writer,
        "description",
        feed.description.as_deref().unwrap_or(&feed.title),
    )?;
    if let Some(ts) = last_updated {
        text_element(&mut writer, "lastBuildDate", &ts.to_rfc2822())?;
    }
    text_element(&mut writer, "generator", GENERATOR)?;

    for article in items {
        start(&mut writer, BytesStart::new("item"))?;
        text_element(&mut writer, "title", &article.title)?;
        text_element(&mut writer, "link", &article.url)?;

        let mut guid = BytesStart::new("guid");
        guid.push_attribute(("isPermaLink", "true"));
        start(&mut writer, guid)?;
        writer
            .write_event(Event::Text(BytesText::new(&article.url)))
            .context("Failed to write guid text")?;
        end(&mut writer, "guid")?;

        text_element(&mut writer, "pubDate", &article.published.to_rfc2822())?;
        if let Some(summary) = &article.summary {
            text_element(&mut writer, "description", &escape_html(summary))?;
        }
        if let Some(category) = &article.category {
            text_element(&mut writer, "category", category)?;
        }
        end(&mut writer, "item")?;
    }

    end(&mut writer, "channel")?;
    end(&mut writer, "rss")?;
    Ok(writer.into_inner().into_inner())
}

// ============================================================================
// Atom 1.0
// ============================================================================

fn write_atom(
    feed: &FeedDefinition,
    items: &[&Article],
    last_updated: Option<DateTime<Utc>>,
) -> Result<Vec<u8>> {
    let mut writer = new_writer()?;

    let mut root = BytesStart::new("feed");
    root.push_attribute(("xmlns", ATOM_NS));
    start(&mut writer, root)?;

    text_element(&mut writer, "title", &feed.title)?;
    if let Some(description) = &feed.description {
        text_element(&mut writer, "subtitle", description)?;
    }
    text_element(&mut writer, "id", &feed.link)?;
    text_element(
        &mut writer,
        "updated",
        &rfc3339(last_updated.unwrap_or(DateTime::UNIX_EPOCH)),
    )?;
    let mut link = BytesStart::new("link");
    link.push_attribute(("href", feed.link.as_str()));
    empty_element(&mut writer, link)?;
    text_element(&mut writer, "generator", GENERATOR)?;

    for article in items {
        start(&mut writer, BytesStart::new("entry"))?;
        text_element(&mut writer, "title", &article.title)?;
        text_element(&mut writer, "id", &article.url)?;

        let mut link = BytesStart::new("link");
        link.push_attribute(("href", article.url.as_str()));
        empty_element(&mut writer, link)?;

        text_element(&mut writer, "updated", &rfc3339(article.last_updated))?;
        text_element(&mut writer, "published", &rfc3339(article.published))?;

        if let Some(summary) = &article.summary {
            let mut element = BytesStart::new("summary");
            element.push_attribute(("type", "html"));
            start(&mut writer, element)?;
            writer
                .write_event(Event::Text(BytesText::new(&escape_html(summary))))
                .context("Failed to write summary text")?;
            end(&mut writer, "summary")?;
        }
        if let Some(category) = &article.category {
            let mut element = BytesStart::new("category");
            element.push_attribute(("term", category.as_str()));
            empty_element(&mut writer, element)?;
        }
        end(&mut writer, "entry")?;
    }

    end(&mut writer, "feed")?;
    Ok(writer.into_inner().into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn feed(format: FeedFormat) -> FeedDefinition {
        FeedDefinition {
            name: "lwn".to_string(),
            title: "LWN headlines".to_string(),
            description: Some("Scraped headlines".to_string()),
            link: "https://lwn.net".to_string(),
            sources: vec!["lwn".to_string()],
            categories: Vec::new(),
            free_only: false,
            max_items: 50,
            format,
        }
    }

    fn article(id: i64, url: &str, published_hour: u32) -> Article {
        let published = Utc.with_ymd_and_hms(2024, 10, 10, published_hour, 0, 0).unwrap();
        Article {
            id,
            url: url.to_string(),
            source_id: "lwn".to_string(),
            title: format!("Article {id}"),
            category: Some("Kernel".to_string()),
            summary: None,
            published,
            first_seen: published,
            last_updated: published,
            fingerprint: "fp".to_string(),
        }
    }

    fn entry_links(body: &str) -> Vec<String> {
        let parsed = feed_rs::parser::parse(body.as_bytes()).unwrap();
        parsed
            .entries
            .iter()
            .map(|e| e.links[0].href.clone())
            .collect()
    }

    #[test]
    fn test_empty_rss_is_valid() {
        let rendered = render_feed(&feed(FeedFormat::Rss), &[]).unwrap();
        assert_eq!(rendered.content_type, RSS_CONTENT_TYPE);

        let parsed = feed_rs::parser::parse(rendered.body.as_bytes()).unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.title.unwrap().content, "LWN headlines");
        assert!(!rendered.body.contains("lastBuildDate"));
    }

    #[test]
    fn test_empty_atom_is_valid() {
        let rendered = render_feed(&feed(FeedFormat::Atom), &[]).unwrap();
        assert_eq!(rendered.content_type, ATOM_CONTENT_TYPE);

        let parsed = feed_rs::parser::parse(rendered.body.as_bytes()).unwrap();
        assert!(parsed.entries.is_empty());
        assert!(rendered.body.contains("<updated>1970-01-01T00:00:00Z</updated>"));
    }

    #[test]
    fn test_items_newest_first_ties_by_url() {
        let articles = vec![
            article(3, "https://lwn.net/Articles/3/", 15),
            article(1, "https://lwn.net/Articles/1/", 11),
            article(2, "https://lwn.net/Articles/2/", 12),
            article(4, "https://lwn.net/Articles/0/", 12),
        ];

        for format in [FeedFormat::Rss, FeedFormat::Atom] {
            let rendered = render_feed(&feed(format), &articles).unwrap();
            assert_eq!(
                entry_links(&rendered.body),
                vec![
                    "https://lwn.net/Articles/3/",
                    "https://lwn.net/Articles/0/",
                    "https://lwn.net/Articles/2/",
                    "https://lwn.net/Articles/1/",
                ]
            );
        }
    }

    #[test]
    fn test_max_items_truncates() {
        let articles: Vec<Article> = (0..5)
            .map(|i| article(i, &format!("https://lwn.net/Articles/{i}/"), i as u32))
            .collect();
        let mut def = feed(FeedFormat::Rss);
        def.max_items = 2;

        let rendered = render_feed(&def, &articles).unwrap();
        assert_eq!(
            entry_links(&rendered.body),
            vec!["https://lwn.net/Articles/4/", "https://lwn.net/Articles/3/"]
        );
    }

    #[test]
    fn test_rss_item_fields() {
        let mut a = article(1, "https://lwn.net/Articles/1/", 14);
        a.last_updated = Utc.with_ymd_and_hms(2024, 10, 11, 8, 0, 0).unwrap();
        let rendered = render_feed(&feed(FeedFormat::Rss), &[a]).unwrap();

        assert!(rendered
            .body
            .contains(r#"<guid isPermaLink="true">https://lwn.net/Articles/1/</guid>"#));
        assert!(rendered
            .body
            .contains("<pubDate>Thu, 10 Oct 2024 14:00:00 +0000</pubDate>"));
        assert!(rendered
            .body
            .contains("<lastBuildDate>Fri, 11 Oct 2024 08:00:00 +0000</lastBuildDate>"));
        assert!(rendered.body.contains("<category>Kernel</category>"));

        let parsed = feed_rs::parser::parse(rendered.body.as_bytes()).unwrap();
        assert_eq!(parsed.entries[0].title.as_ref().unwrap().content, "Article 1");
        assert!(parsed.entries[0].published.is_some());
    }

    #[test]
    fn test_summary_is_html_then_xml_escaped() {
        let mut a = article(1, "https://lwn.net/Articles/1/", 14);
        a.title = "Rust & <C>".to_string();
        a.summary = Some("<b>bold</b> & more".to_string());

        let rendered = render_feed(&feed(FeedFormat::Rss), &[a]).unwrap();
        assert!(rendered
            .body
            .contains("&amp;lt;b&amp;gt;bold&amp;lt;/b&amp;gt; &amp;amp; more"));
        assert!(rendered.body.contains("<title>Rust &amp; &lt;C&gt;</title>"));

        let parsed = feed_rs::parser::parse(rendered.body.as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 1);
    }

    #[test]
    fn test_atom_entry_fields() {
        let mut a = article(1, "https://lwn.net/Articles/1/", 14);
        a.summary = Some("plain".to_string());
        let rendered = render_feed(&feed(FeedFormat::Atom), &[a]).unwrap();

        assert!(rendered.body.contains("<id>https://lwn.net/Articles/1/</id>"));
        assert!(rendered.body.contains("<published>2024-10-10T14:00:00Z</published>"));
        assert!(rendered.body.contains(r#"<summary type="html">plain</summary>"#));
        assert!(rendered.body.contains(r#"<category term="Kernel"/>"#));

        let parsed = feed_rs::parser::parse(rendered.body.as_bytes()).unwrap();
        assert_eq!(parsed.entries[0].id, "https://lwn.net/Articles/1/");
    }

    #[tokio::test]
    async fn test_build_feed_reads_selection() {
        use crate::storage::ArticleRecord;

        let db = Database::open(":memory:").await.unwrap();
        for (url, source) in [("https://lwn.net/a", "lwn"), ("https://other.test/b", "other")] {
            db.insert_article(
                &ArticleRecord {
                    url: url.to_string(),
                    source_id: source.to_string(),
                    title: url.to_string(),
                    category: None,
                    summary: None,
                    published: Some(100),
                    fingerprint: "fp".to_string(),
                },
                100,
            )
            .await
            .unwrap();
        }

        let rendered = build_feed(&db, &feed(FeedFormat::Rss)).await.unwrap();
        assert_eq!(entry_links(&rendered.body), vec!["https://lwn.net/a"]);
    }
}
