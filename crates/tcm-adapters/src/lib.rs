//! Source adapter contracts + one adapter per known upstream response shape.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tcm_core::{RawArticle, SourceReliability};
use tcm_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "tcm-adapters";

/// Which provider response shape a source speaks. Adding a shape means
/// adding one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceShape {
    NewsApi,
    NewsData,
    Webz,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One upstream provider. `fetch_articles` owns the provider's URL/auth
/// conventions; parsing is a separate method so it is testable offline.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_articles(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawArticle>, AdapterError>;
}

pub fn build_adapter(
    shape: SourceShape,
    source_id: &str,
    endpoint: &str,
    api_key: Option<String>,
    reliability: SourceReliability,
) -> Box<dyn SourceAdapter> {
    let source_id = source_id.to_string();
    let endpoint = endpoint.to_string();
    match shape {
        SourceShape::NewsApi => Box::new(NewsApiAdapter {
            source_id,
            endpoint,
            api_key,
            reliability,
        }),
        SourceShape::NewsData => Box::new(NewsDataAdapter {
            source_id,
            endpoint,
            api_key,
            reliability,
        }),
        SourceShape::Webz => Box::new(WebzAdapter {
            source_id,
            endpoint,
            api_key,
            reliability,
        }),
    }
}

// ---- newsapi shape: { "articles": [ { source.name, title, description,
// content, publishedAt, url } ] }, key in the X-Api-Key header ----

struct NewsApiAdapter {
    source_id: String,
    endpoint: String,
    api_key: Option<String>,
    reliability: SourceReliability,
}

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsApiArticle {
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    url: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<DateTime<Utc>>,
    source: Option<NewsApiSourceRef>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSourceRef {
    name: Option<String>,
}

impl NewsApiAdapter {
    fn parse_response(&self, body: &[u8]) -> Result<Vec<RawArticle>, AdapterError> {
        let response: NewsApiResponse = serde_json::from_slice(body)
            .map_err(|e| AdapterError::Message(format!("invalid newsapi response: {e}")))?;
        let articles = response
            .articles
            .into_iter()
            .filter_map(|item| {
                let title = non_empty(item.title)?;
                let url = non_empty(item.url)?;
                Some(RawArticle {
                    title,
                    description: non_empty(item.description),
                    body: item.content,
                    published_at: item.published_at,
                    source_name: item
                        .source
                        .and_then(|s| s.name)
                        .unwrap_or_else(|| self.source_id.clone()),
                    url,
                    source_reliability: self.reliability,
                })
            })
            .collect();
        Ok(articles)
    }
}

#[async_trait]
impl SourceAdapter for NewsApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_articles(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawArticle>, AdapterError> {
        let pairs = [("q", query), ("sortBy", "publishedAt"), ("pageSize", "25")];
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(key) = &self.api_key {
            headers.push(("X-Api-Key", key));
        }
        let resp = http
            .fetch_bytes(&self.source_id, &self.endpoint, &pairs, &headers)
            .await?;
        let articles = self.parse_response(&resp.body)?;
        debug!(source_id = %self.source_id, count = articles.len(), "parsed upstream batch");
        Ok(articles)
    }
}

// ---- newsdata shape: { "results": [ { title, description, content,
// pubDate ("YYYY-MM-DD HH:MM:SS"), source_id, link } ] }, key as the
// apikey query parameter ----

struct NewsDataAdapter {
    source_id: String,
    endpoint: String,
    api_key: Option<String>,
    reliability: SourceReliability,
}

#[derive(Debug, Deserialize)]
struct NewsDataResponse {
    #[serde(default)]
    results: Vec<NewsDataItem>,
}

#[derive(Debug, Deserialize)]
struct NewsDataItem {
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    source_id: Option<String>,
}

fn parse_newsdata_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

impl NewsDataAdapter {
    fn parse_response(&self, body: &[u8]) -> Result<Vec<RawArticle>, AdapterError> {
        let response: NewsDataResponse = serde_json::from_slice(body)
            .map_err(|e| AdapterError::Message(format!("invalid newsdata response: {e}")))?;
        let articles = response
            .results
            .into_iter()
            .filter_map(|item| {
                let title = non_empty(item.title)?;
                let url = non_empty(item.link)?;
                Some(RawArticle {
                    title,
                    description: non_empty(item.description),
                    body: item.content,
                    published_at: item.pub_date.as_deref().and_then(parse_newsdata_timestamp),
                    source_name: item.source_id.unwrap_or_else(|| self.source_id.clone()),
                    url,
                    source_reliability: self.reliability,
                })
            })
            .collect();
        Ok(articles)
    }
}

#[async_trait]
impl SourceAdapter for NewsDataAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_articles(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawArticle>, AdapterError> {
        let mut pairs: Vec<(&str, &str)> = vec![("q", query), ("language", "en")];
        if let Some(key) = &self.api_key {
            pairs.push(("apikey", key));
        }
        let resp = http
            .fetch_bytes(&self.source_id, &self.endpoint, &pairs, &[])
            .await?;
        let articles = self.parse_response(&resp.body)?;
        debug!(source_id = %self.source_id, count = articles.len(), "parsed upstream batch");
        Ok(articles)
    }
}

// ---- webz shape: { "posts": [ { thread.site, title, text, url,
// published (rfc3339 with offset) } ] }, key as the token query
// parameter ----

struct WebzAdapter {
    source_id: String,
    endpoint: String,
    api_key: Option<String>,
    reliability: SourceReliability,
}

#[derive(Debug, Deserialize)]
struct WebzResponse {
    #[serde(default)]
    posts: Vec<WebzPost>,
}

#[derive(Debug, Deserialize)]
struct WebzPost {
    title: Option<String>,
    text: Option<String>,
    url: Option<String>,
    published: Option<String>,
    thread: Option<WebzThread>,
}

#[derive(Debug, Deserialize)]
struct WebzThread {
    site: Option<String>,
}

fn parse_webz_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl WebzAdapter {
    fn parse_response(&self, body: &[u8]) -> Result<Vec<RawArticle>, AdapterError> {
        let response: WebzResponse = serde_json::from_slice(body)
            .map_err(|e| AdapterError::Message(format!("invalid webz response: {e}")))?;
        let articles = response
            .posts
            .into_iter()
            .filter_map(|post| {
                let title = non_empty(post.title)?;
                let url = non_empty(post.url)?;
                Some(RawArticle {
                    title,
                    description: non_empty(post.text),
                    body: None,
                    published_at: post.published.as_deref().and_then(parse_webz_timestamp),
                    source_name: post
                        .thread
                        .and_then(|t| t.site)
                        .unwrap_or_else(|| self.source_id.clone()),
                    url,
                    source_reliability: self.reliability,
                })
            })
            .collect();
        Ok(articles)
    }
}

#[async_trait]
impl SourceAdapter for WebzAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_articles(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawArticle>, AdapterError> {
        let mut pairs: Vec<(&str, &str)> = vec![("q", query)];
        if let Some(key) = &self.api_key {
            pairs.push(("token", key));
        }
        let resp = http
            .fetch_bytes(&self.source_id, &self.endpoint, &pairs, &[])
            .await?;
        let articles = self.parse_response(&resp.body)?;
        debug!(source_id = %self.source_id, count = articles.len(), "parsed upstream batch");
        Ok(articles)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

// ---- simulated fallback ----

/// Built-in dataset used when every live source is down or empty. Articles
/// carry stable urls and publish times so repeated fallback cycles mint the
/// same alert ids and dedup to zero; the dataset choice rotates randomly to
/// mimic a changing feed.
pub struct SimulatedSource;

impl SimulatedSource {
    pub fn new() -> Self {
        Self
    }

    pub fn dataset_a() -> Vec<RawArticle> {
        vec![
            sim_article(
                "US Announces New Semiconductor Tariffs on Asian Imports",
                "25% tariff on semiconductor shipments from China and Taiwan effective April 1, 2025",
                "Global Trade Magazine",
                "https://simulated.tcm.dev/articles/semiconductor-tariffs",
                "2025-03-08T09:15:00Z",
                SourceReliability::High,
            ),
            sim_article(
                "EU Imposes Quota on Steel Imports from Russia",
                "New quota limits steel shipments starting 06/01/2025",
                "Brussels Trade Desk",
                "https://simulated.tcm.dev/articles/eu-steel-quota",
                "2025-03-08T10:40:00Z",
                SourceReliability::High,
            ),
            sim_article(
                "Canada Orders Ban on Lumber Exports to United States",
                "Softwood lumber shipments from Canada face prohibition effective immediately",
                "Ottawa Business Journal",
                "https://simulated.tcm.dev/articles/canada-lumber-ban",
                "2025-03-08T11:05:00Z",
                SourceReliability::VeryHigh,
            ),
        ]
    }

    pub fn dataset_b() -> Vec<RawArticle> {
        vec![
            sim_article(
                "China Restricts Rare Earth Shipments with New License Rules",
                "Export license requirements begin next month for rare earth producers",
                "Asia Trade Monitor",
                "https://simulated.tcm.dev/articles/china-rare-earth-license",
                "2025-03-09T08:20:00Z",
                SourceReliability::High,
            ),
            sim_article(
                "Saudi Arabia Sets 15% Export Tax on Petroleum Products",
                "The levy on petroleum shipments takes effect starting July 1, 2025",
                "Gulf Energy Review",
                "https://simulated.tcm.dev/articles/saudi-petroleum-tax",
                "2025-03-09T09:45:00Z",
                SourceReliability::Medium,
            ),
            sim_article(
                "India Imposes Sanctions on Electronics Imports from Vietnam",
                "Penalty measures cover smartphone shipments to India effective 08/15/2025",
                "Delhi Commerce Daily",
                "https://simulated.tcm.dev/articles/india-electronics-sanctions",
                "2025-03-09T10:30:00Z",
                SourceReliability::High,
            ),
        ]
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for SimulatedSource {
    fn source_id(&self) -> &str {
        "simulated"
    }

    async fn fetch_articles(
        &self,
        _http: &HttpFetcher,
        _query: &str,
    ) -> Result<Vec<RawArticle>, AdapterError> {
        let pick = rand::rng().random_range(0..2);
        let articles = if pick == 0 {
            Self::dataset_a()
        } else {
            Self::dataset_b()
        };
        debug!(dataset = pick, count = articles.len(), "serving simulated articles");
        Ok(articles)
    }
}

fn sim_article(
    title: &str,
    description: &str,
    source_name: &str,
    url: &str,
    published_at: &str,
    reliability: SourceReliability,
) -> RawArticle {
    let published_at = DateTime::parse_from_rfc3339(published_at)
        .ok()
        .map(|dt| dt.with_timezone(&Utc));
    RawArticle {
        title: title.to_string(),
        description: Some(description.to_string()),
        body: None,
        published_at,
        source_name: source_name.to_string(),
        url: url.to_string(),
        source_reliability: reliability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newsapi() -> NewsApiAdapter {
        NewsApiAdapter {
            source_id: "newsapi-trade".to_string(),
            endpoint: "https://newsapi.example/v2/everything".to_string(),
            api_key: None,
            reliability: SourceReliability::High,
        }
    }

    #[test]
    fn newsapi_parse_maps_fields_and_stamps_reliability() {
        let body = br#"{
            "status": "ok",
            "totalResults": 1,
            "articles": [
                {
                    "source": {"id": null, "name": "Reuters"},
                    "title": "US Announces New Semiconductor Tariffs",
                    "description": "25% tariff effective April 1, 2025",
                    "content": "Full text here",
                    "publishedAt": "2025-03-08T09:15:00Z",
                    "url": "https://reuters.example/a/1"
                }
            ]
        }"#;
        let articles = newsapi().parse_response(body).unwrap();
        assert_eq!(articles.len(), 1);
        let article = &articles[0];
        assert_eq!(article.title, "US Announces New Semiconductor Tariffs");
        assert_eq!(article.source_name, "Reuters");
        assert_eq!(article.url, "https://reuters.example/a/1");
        assert_eq!(article.source_reliability, SourceReliability::High);
        assert_eq!(
            article.published_at.map(|dt| dt.to_rfc3339()),
            Some("2025-03-08T09:15:00+00:00".to_string())
        );
    }

    #[test]
    fn newsapi_parse_skips_items_without_title_or_url() {
        let body = br#"{
            "articles": [
                {"title": null, "url": "https://x.example/1"},
                {"title": "Has title, no url", "url": ""},
                {"title": "Keeper", "url": "https://x.example/2"}
            ]
        }"#;
        let articles = newsapi().parse_response(body).unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].title, "Keeper");
        // missing source block falls back to the adapter's source id
        assert_eq!(articles[0].source_name, "newsapi-trade");
    }

    #[test]
    fn newsapi_parse_rejects_malformed_payload() {
        let err = newsapi().parse_response(b"<html>502</html>").unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn newsdata_parse_handles_plain_timestamps() {
        let adapter = NewsDataAdapter {
            source_id: "newsdata-trade".to_string(),
            endpoint: "https://newsdata.example/api/1/news".to_string(),
            api_key: None,
            reliability: SourceReliability::Medium,
        };
        let body = br#"{
            "status": "success",
            "results": [
                {
                    "title": "EU Steel Quota Tightened",
                    "link": "https://trade.example/eu-steel",
                    "description": "Quota starting 06/01/2025",
                    "content": null,
                    "pubDate": "2025-03-08 10:40:00",
                    "source_id": "brussels_desk"
                },
                {
                    "title": "Bad date survives as None",
                    "link": "https://trade.example/bad-date",
                    "pubDate": "sometime soon",
                    "source_id": null
                }
            ]
        }"#;
        let articles = adapter.parse_response(body).unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].source_name, "brussels_desk");
        assert_eq!(
            articles[0].published_at.map(|dt| dt.to_rfc3339()),
            Some("2025-03-08T10:40:00+00:00".to_string())
        );
        assert!(articles[1].published_at.is_none());
        assert_eq!(articles[1].source_name, "newsdata-trade");
    }

    #[test]
    fn webz_parse_reads_nested_thread_site() {
        let adapter = WebzAdapter {
            source_id: "webz-news".to_string(),
            endpoint: "https://webz.example/newsApiLite".to_string(),
            api_key: None,
            reliability: SourceReliability::Low,
        };
        let body = br#"{
            "posts": [
                {
                    "thread": {"site": "ft.com"},
                    "title": "Canada Lumber Ban Widens",
                    "text": "Prohibition effective immediately",
                    "url": "https://ft.example/lumber",
                    "published": "2025-03-08T11:05:00.000+02:00"
                }
            ]
        }"#;
        let articles = adapter.parse_response(body).unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].source_name, "ft.com");
        assert_eq!(articles[0].source_reliability, SourceReliability::Low);
        assert_eq!(
            articles[0].published_at.map(|dt| dt.to_rfc3339()),
            Some("2025-03-08T09:05:00+00:00".to_string())
        );
    }

    #[test]
    fn build_adapter_covers_every_shape() {
        for shape in [SourceShape::NewsApi, SourceShape::NewsData, SourceShape::Webz] {
            let adapter = build_adapter(
                shape,
                "some-source",
                "https://example.test/feed",
                Some("key".to_string()),
                SourceReliability::Medium,
            );
            assert_eq!(adapter.source_id(), "some-source");
        }
    }

    #[test]
    fn simulated_datasets_are_stable_and_distinct() {
        let a = SimulatedSource::dataset_a();
        let b = SimulatedSource::dataset_b();
        assert!(!a.is_empty());
        assert!(!b.is_empty());
        for article in a.iter().chain(b.iter()) {
            assert!(article.published_at.is_some());
            assert!(article.url.starts_with("https://simulated.tcm.dev/"));
        }
        let mut urls: Vec<&str> = a
            .iter()
            .chain(b.iter())
            .map(|article| article.url.as_str())
            .collect();
        urls.sort_unstable();
        urls.dedup();
        assert_eq!(urls.len(), a.len() + b.len());
        // same call, same content: ids minted downstream stay stable
        assert_eq!(SimulatedSource::dataset_a(), a);
    }

    #[tokio::test]
    async fn simulated_source_always_serves_articles() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let articles = SimulatedSource::new()
            .fetch_articles(&http, "ignored")
            .await
            .unwrap();
        assert!(!articles.is_empty());
    }
}
