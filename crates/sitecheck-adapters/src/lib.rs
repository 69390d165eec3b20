//! Page metadata extraction and sitemap enumeration.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::Event;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sitecheck_core::CandidatePage;
use sitecheck_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sitecheck-adapters";

/// Sitemap files whose `loc` contains one of these markers are skipped by default.
pub const DEFAULT_EXCLUDED_SITEMAP_MARKERS: &[&str] = &["local-sitemap.xml"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
}

/// Title and `og:title` of a page. Absent markup yields empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: String,
    pub og_title: String,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

pub fn extract_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, "title").unwrap_or_default();
    let og_title =
        select_first_attr(&document, r#"meta[property="og:title"]"#, "content").unwrap_or_default();
    PageMetadata {
        title: title.unwrap_or_default(),
        og_title: og_title.unwrap_or_default(),
    }
}

/// Fetch `url` and extract its metadata. Any fetch failure yields empty metadata.
pub async fn fetch_metadata(http: &HttpFetcher, url: &str) -> PageMetadata {
    match http.fetch_text(url).await {
        Ok(resp) => extract_metadata(&resp.body),
        Err(err) => {
            debug!(url, error = %err, "metadata fetch failed");
            PageMetadata::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("fetching sitemap: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing sitemap xml: {0}")]
    Xml(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    Loc,
    Lastmod,
}

/// Collect `loc`/`lastmod` of every `container` element (`sitemap` or `url`),
/// matching on local names so namespaced and bare documents both parse.
/// Only direct children of the container are read; nested extension elements
/// such as `<image:image><image:loc>` are ignored.
fn parse_entries(xml: &str, container: &[u8]) -> Result<Vec<SitemapEntry>, SitemapError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut current: Option<SitemapEntry> = None;
    let mut capture = Capture::None;
    let mut text = String::new();
    // element depth below the open container
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| SitemapError::Xml(format!("{e} at {}", reader.buffer_position())))?;
        match event {
            Event::Start(ref e) => {
                let name = e.local_name();
                if current.is_none() && name.as_ref() == container {
                    current = Some(SitemapEntry {
                        loc: String::new(),
                        lastmod: None,
                    });
                    depth = 0;
                } else if current.is_some() {
                    depth += 1;
                    capture = match (depth, name.as_ref()) {
                        (1, b"loc") => Capture::Loc,
                        (1, b"lastmod") => Capture::Lastmod,
                        _ => Capture::None,
                    };
                    text.clear();
                }
            }
            Event::Text(e) if capture != Capture::None => {
                let decoded = e
                    .decode()
                    .map_err(|err| SitemapError::Xml(err.to_string()))?;
                text.push_str(&decoded);
            }
            Event::CData(e) if capture != Capture::None => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Event::GeneralRef(e) if capture != Capture::None => {
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else if let Ok(name) = e.decode() {
                    match quick_xml::escape::resolve_predefined_entity(&name) {
                        Some(resolved) => text.push_str(resolved),
                        None => warn!(entity = %name, "unknown entity in sitemap"),
                    }
                }
            }
            Event::End(ref e) => {
                let name = e.local_name();
                if depth == 0 && name.as_ref() == container {
                    if let Some(entry) = current.take() {
                        if !entry.loc.is_empty() {
                            entries.push(entry);
                        }
                    }
                } else if let Some(entry) = current.as_mut() {
                    let value = text.trim().to_string();
                    match capture {
                        Capture::Loc => entry.loc = value,
                        Capture::Lastmod if !value.is_empty() => entry.lastmod = Some(value),
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                    capture = Capture::None;
                    text.clear();
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

/// `loc` of every `<sitemap>` in a sitemap index.
pub fn parse_sitemap_index(xml: &str) -> Result<Vec<String>, SitemapError> {
    Ok(parse_entries(xml, b"sitemap")?
        .into_iter()
        .map(|e| e.loc)
        .collect())
}

/// Every `<url>` of a sitemap as a candidate page.
pub fn parse_sitemap(xml: &str) -> Result<Vec<CandidatePage>, SitemapError> {
    Ok(parse_entries(xml, b"url")?
        .into_iter()
        .map(|e| {
            let last_modified = e.lastmod.as_deref().and_then(parse_lastmod);
            CandidatePage::new(e.loc).with_last_modified(last_modified)
        })
        .collect())
}

/// W3C datetime as used by sitemaps: RFC 3339, minute precision with a zone,
/// or a bare datetime, date, year-month or year taken as UTC.
pub fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = value.strip_suffix('Z').unwrap_or(value);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }
    let date = match value.len() {
        4 => format!("{value}-01-01"),
        7 => format!("{value}-01"),
        _ => value.to_string(),
    };
    NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Enumerates the pages a site declares.
#[async_trait]
pub trait SitemapSource: Send + Sync {
    async fn list_sitemap_files(&self) -> Result<Vec<String>, SitemapError>;
    async fn list_pages(&self, sitemap_url: &str) -> Result<Vec<CandidatePage>, SitemapError>;
}

#[derive(Debug, Clone)]
pub struct HttpSitemapSource {
    http: HttpFetcher,
    index_url: String,
    excluded_markers: Vec<String>,
    single_sitemap_fallback: bool,
}

impl HttpSitemapSource {
    pub fn new(http: HttpFetcher, index_url: impl Into<String>) -> Self {
        Self {
            http,
            index_url: index_url.into(),
            excluded_markers: DEFAULT_EXCLUDED_SITEMAP_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            single_sitemap_fallback: false,
        }
    }

    pub fn with_excluded_markers(mut self, markers: Vec<String>) -> Self {
        self.excluded_markers = markers;
        self
    }

    /// When the index document lists no `<sitemap>` entries, treat the index URL
    /// itself as the only sitemap.
    pub fn with_single_sitemap_fallback(mut self, enabled: bool) -> Self {
        self.single_sitemap_fallback = enabled;
        self
    }

    pub fn index_url(&self) -> &str {
        &self.index_url
    }

    fn is_excluded(&self, loc: &str) -> bool {
        self.excluded_markers
            .iter()
            .any(|marker| !marker.is_empty() && loc.contains(marker.as_str()))
    }
}

#[async_trait]
impl SitemapSource for HttpSitemapSource {
    async fn list_sitemap_files(&self) -> Result<Vec<String>, SitemapError> {
        let resp = self.http.fetch_text(&self.index_url).await?;
        let locs = parse_sitemap_index(&resp.body)?;
        if locs.is_empty() && self.single_sitemap_fallback {
            return Ok(vec![self.index_url.clone()]);
        }
        let files: Vec<String> = locs.into_iter().filter(|loc| !self.is_excluded(loc)).collect();
        info!(index = %self.index_url, sitemaps = files.len(), "listed sitemap files");
        Ok(files)
    }

    async fn list_pages(&self, sitemap_url: &str) -> Result<Vec<CandidatePage>, SitemapError> {
        let resp = self.http.fetch_text(sitemap_url).await?;
        parse_sitemap(&resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitecheck_storage::HttpClientConfig;
    use std::time::Duration;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://www.example.com/page-sitemap.xml</loc><lastmod>2024-05-01</lastmod></sitemap>
  <sitemap><loc>https://www.example.com/local-sitemap.xml</loc></sitemap>
  <sitemap><loc> https://www.example.com/post-sitemap.xml </loc></sitemap>
</sitemapindex>"#;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://www.example.com/</loc><lastmod>2024-05-01T10:00:00+02:00</lastmod></url>
  <url><loc>https://www.example.com/about</loc><lastmod>2024-04-01</lastmod></url>
  <url><loc>https://www.example.com/search?a=1&amp;b=2</loc></url>
  <url><lastmod>2024-04-01</lastmod></url>
</urlset>"#;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .expect("fetcher")
    }

    #[test]
    fn extracts_title_and_og_title() {
        let html = r#"<html><head>
            <title> About Us </title>
            <meta property="og:title" content="About">
        </head><body><h1>ignored</h1></body></html>"#;
        let meta = extract_metadata(html);
        assert_eq!(meta.title, "About Us");
        assert_eq!(meta.og_title, "About");
    }

    #[test]
    fn absent_or_malformed_markup_yields_empty_fields() {
        assert_eq!(extract_metadata(""), PageMetadata::default());
        let meta = extract_metadata("<html><head><title>Only title</title><body><div><p>unclosed");
        assert_eq!(meta.title, "Only title");
        assert_eq!(meta.og_title, "");
        let meta = extract_metadata(r#"<meta name="og:title" content="wrong attribute">"#);
        assert_eq!(meta.og_title, "");
    }

    #[test]
    fn parses_sitemap_index_locs() {
        let locs = parse_sitemap_index(INDEX).expect("index");
        assert_eq!(
            locs,
            vec![
                "https://www.example.com/page-sitemap.xml",
                "https://www.example.com/local-sitemap.xml",
                "https://www.example.com/post-sitemap.xml",
            ]
        );
        assert!(parse_sitemap_index(URLSET).expect("urlset").is_empty());
    }

    #[test]
    fn parses_urlset_pages_with_lastmod() {
        let pages = parse_sitemap(URLSET).expect("urlset");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].url, "https://www.example.com/");
        assert_eq!(
            pages[0].last_modified,
            parse_lastmod("2024-05-01T08:00:00Z")
        );
        assert_eq!(pages[1].last_modified, parse_lastmod("2024-04-01T00:00:00Z"));
        assert_eq!(pages[2].url, "https://www.example.com/search?a=1&b=2");
        assert_eq!(pages[2].last_modified, None);
    }

    #[test]
    fn lastmod_accepts_w3c_variants() {
        let utc = |s: &str| DateTime::parse_from_rfc3339(s).expect("rfc3339").with_timezone(&Utc);
        assert!(parse_lastmod("2024-01-02").is_some());
        assert!(parse_lastmod("2024-01-02T03:04:05").is_some());
        assert!(parse_lastmod("2024-01-02T03:04:05Z").is_some());
        assert_eq!(
            parse_lastmod("2024-01-02T03:04:05.250+01:00"),
            Some(utc("2024-01-02T02:04:05.250Z"))
        );
        assert_eq!(
            parse_lastmod("2024-05-01T10:00+02:00"),
            Some(utc("2024-05-01T08:00:00Z"))
        );
        assert_eq!(parse_lastmod("2024-05-01T10:00Z"), Some(utc("2024-05-01T10:00:00Z")));
        assert_eq!(parse_lastmod("2024-05"), Some(utc("2024-05-01T00:00:00Z")));
        assert_eq!(parse_lastmod("2024"), Some(utc("2024-01-01T00:00:00Z")));
        assert!(parse_lastmod("yesterday").is_none());
        assert!(parse_lastmod("2024-13").is_none());
    }

    #[test]
    fn nested_image_locs_do_not_replace_page_loc() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:image="http://www.google.com/schemas/sitemap-image/1.1">
  <url>
    <loc>https://www.example.com/about</loc>
    <image:image>
      <image:loc>https://www.example.com/wp-content/uploads/hero.png</image:loc>
    </image:image>
    <lastmod>2024-05-01T10:00+02:00</lastmod>
  </url>
  <url>
    <image:image><image:loc>https://www.example.com/wp-content/uploads/first.png</image:loc></image:image>
    <loc>https://www.example.com/team</loc>
  </url>
</urlset>"#;
        let pages = parse_sitemap(xml).expect("urlset");
        let urls: Vec<_> = pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://www.example.com/about", "https://www.example.com/team"]
        );
        assert_eq!(pages[0].last_modified, parse_lastmod("2024-05-01T08:00:00Z"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_sitemap("<urlset><url><loc>x</url></urlset>").is_err());
    }

    #[tokio::test]
    async fn http_source_skips_excluded_sitemaps() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/sitemap_index.xml")
            .with_status(200)
            .with_body(INDEX)
            .create_async()
            .await;

        let source =
            HttpSitemapSource::new(fetcher(), format!("{}/sitemap_index.xml", server.url()));
        let files = source.list_sitemap_files().await.expect("files");
        assert_eq!(
            files,
            vec![
                "https://www.example.com/page-sitemap.xml",
                "https://www.example.com/post-sitemap.xml",
            ]
        );
    }

    #[tokio::test]
    async fn http_source_falls_back_to_single_sitemap() {
        let mut server = mockito::Server::new_async().await;
        let _index = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body(URLSET)
            .expect(2)
            .create_async()
            .await;

        let index_url = format!("{}/sitemap.xml", server.url());
        let source =
            HttpSitemapSource::new(fetcher(), index_url.clone()).with_single_sitemap_fallback(true);
        let files = source.list_sitemap_files().await.expect("files");
        assert_eq!(files, vec![index_url.clone()]);
        let pages = source.list_pages(&index_url).await.expect("pages");
        assert_eq!(pages.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_index_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/sitemap_index.xml")
            .with_status(503)
            .create_async()
            .await;
        let source =
            HttpSitemapSource::new(fetcher(), format!("{}/sitemap_index.xml", server.url()));
        assert!(matches!(
            source.list_sitemap_files().await,
            Err(SitemapError::Fetch(FetchError::HttpStatus { status: 503, .. }))
        ));
    }

    #[tokio::test]
    async fn fetch_metadata_swallows_failures() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/gone")
            .with_status(500)
            .create_async()
            .await;
        let meta = fetch_metadata(&fetcher(), &format!("{}/gone", server.url())).await;
        assert_eq!(meta, PageMetadata::default());
    }
}
