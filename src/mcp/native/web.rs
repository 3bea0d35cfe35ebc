//! Web page fetching and `SearXNG` search.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{NativeTool, str_arg};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_LENGTH: usize = 8000;
const DEFAULT_NUM_RESULTS: usize = 5;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Candidate containers for the main content, in priority order.
const MAIN_CONTENT_SELECTORS: &[&str] = &[
    "main", "article", "#content", ".content", "#main", ".main", ".post", ".article",
];

const NOISE_SELECTOR: &str = "script, style, iframe, noscript, nav, footer, aside";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Markdown,
    Text,
    Html,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "text" => Ok(Self::Text),
            "html" => Ok(Self::Html),
            other => Err(anyhow!("unsupported format '{other}', use markdown, text or html")),
        }
    }
}

/// Pull the readable part out of an HTML document.
#[must_use]
pub fn extract_content(html: &str, format: OutputFormat) -> String {
    let document = Html::parse_document(html);
    let mut candidates = MAIN_CONTENT_SELECTORS
        .iter()
        .chain(std::iter::once(&"body"))
        .filter_map(|s| Selector::parse(s).ok());
    let Some(root) = candidates.find_map(|sel| document.select(&sel).next()) else {
        return String::new();
    };

    let mut cleaned = root.html();
    let Ok(noise_selector) = Selector::parse(NOISE_SELECTOR) else {
        return cleaned;
    };
    for noise in root.select(&noise_selector) {
        cleaned = cleaned.replace(&noise.html(), "");
    }

    match format {
        OutputFormat::Html => cleaned,
        OutputFormat::Text => {
            let fragment = Html::parse_fragment(&cleaned);
            let text = fragment.root_element().text().collect::<Vec<_>>().join("\n");
            non_blank_lines(&text, str::trim)
        }
        OutputFormat::Markdown => non_blank_lines(&html2md::parse_html(&cleaned), str::trim_end),
    }
}

fn non_blank_lines(text: &str, trim: fn(&str) -> &str) -> String {
    text.lines()
        .map(trim)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cut `text` to at most `max_length` characters, noting the cut.
#[must_use]
pub fn truncate_chars(text: &str, max_length: usize) -> String {
    let total = text.chars().count();
    if total <= max_length {
        return text.to_string();
    }
    let head: String = text.chars().take(max_length).collect();
    format!("{head}\n\n[Content truncated, original length {total} characters]")
}

#[derive(Debug)]
pub struct FetchWebContentTool {
    client: Client,
}

impl FetchWebContentTool {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(BROWSER_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str, format: OutputFormat) -> anyhow::Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            bail!("invalid URL: {url}");
        }

        let response = self
            .client
            .get(parsed)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("text/html") || content_type.contains("application/xhtml") {
            let body = response.text().await?;
            Ok(extract_content(&body, format))
        } else if content_type.contains("application/json") || content_type.contains("text/plain") {
            Ok(response.text().await?)
        } else {
            bail!("unsupported content type: {content_type}")
        }
    }
}

#[async_trait]
impl NativeTool for FetchWebContentTool {
    fn name(&self) -> &str {
        "fetch_web_content"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its main content. Without a concrete URL, use search_web first to find links."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Page URL (http or https)." },
                "format": {
                    "type": "string",
                    "enum": ["markdown", "text", "html"],
                    "description": "Output format, defaults to markdown."
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum number of characters returned, defaults to 8000."
                }
            },
            "required": ["url"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let url = str_arg(&args, "url")?;
        let format: OutputFormat = args["format"].as_str().unwrap_or("markdown").parse()?;
        let max_length = args["max_length"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_LENGTH);

        tracing::info!(url = %url, ?format, "Fetching web content");
        let content = self.fetch(url, format).await?;
        Ok(Value::String(truncate_chars(&content, max_length)))
    }
}

#[derive(Debug, Deserialize)]
struct SearXNGResponse {
    #[serde(default)]
    results: Vec<SearXNGResult>,
}

#[derive(Debug, Deserialize)]
struct SearXNGResult {
    title: String,
    url: String,
    content: Option<String>,
}

/// Web search through a `SearXNG` instance.
#[derive(Debug)]
pub struct SearchWebTool {
    client: Client,
    base_url: Option<String>,
}

impl SearchWebTool {
    pub fn new(base_url: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("mcp-chat/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.filter(|u| !u.trim().is_empty()),
        })
    }
}

fn format_results(query: &str, results: &[SearXNGResult]) -> String {
    if results.is_empty() {
        return format!("No results found for '{query}'");
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let snippet = r.content.as_deref().unwrap_or_default().trim();
            format!("{}. {}\n   URL: {}\n   {snippet}", i + 1, r.title.trim(), r.url)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl NativeTool for SearchWebTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the web. Afterwards, use fetch_web_content to read a specific result page in detail."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query." },
                "num_results": { "type": "integer", "description": "Number of results to return." }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let query = str_arg(&args, "query")?;
        let limit = args["num_results"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_NUM_RESULTS);
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("web search is not configured (set SEARXNG_URL)"))?;

        tracing::info!(query = %query, limit, "Searching the web");

        let response = self
            .client
            .get(format!("{}/search", base.trim_end_matches('/')))
            .query(&[("q", query), ("format", "json"), ("pageno", "1")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("SearXNG error {status}: {text}");
        }

        let mut body: SearXNGResponse = response.json().await?;
        body.results.truncate(limit);
        Ok(Value::String(format_results(query, &body.results)))
    }
}
