//! Product page scraping over plain HTTP.
//!
//! The page HTML is reduced to text and handed to the text generator, which
//! structures it into [`ProductSpecs`] JSON. Reference images are picked
//! from the page's product thumbnails (`alt="PDP Thumbnail Image N"`), with
//! `og:image` as a fallback when no thumbnail matches.

use super::{check_status, ProductScraper, TextGenerator};
use crate::error::CallError;
use crate::extract::extract_as;
use crate::model::{ImageRef, ProductPage, ProductSpecs};
use crate::prompts;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("product2mesh/", env!("CARGO_PKG_VERSION"));

/// [`ProductScraper`] that downloads the page and asks a generator to structure it.
pub struct HttpProductScraper {
    client: reqwest::Client,
    generator: Arc<dyn TextGenerator>,
    page_timeout: Duration,
    thumbnail_indices: Vec<usize>,
    max_text_chars: usize,
}

impl HttpProductScraper {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            client: reqwest::Client::new(),
            generator,
            page_timeout: Duration::from_secs(60),
            thumbnail_indices: vec![1, 4],
            max_text_chars: 20_000,
        }
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn with_thumbnail_indices(mut self, indices: Vec<usize>) -> Self {
        self.thumbnail_indices = indices;
        self
    }

    async fn fetch_html(&self, url: &str) -> Result<String, CallError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.page_timeout)
            .send()
            .await
            .map_err(|e| match CallError::from(e) {
                CallError::Timeout | CallError::Network(_) => CallError::ScrapeUnavailable(format!(
                    "{} did not respond within {}s",
                    url,
                    self.page_timeout.as_secs()
                )),
                other => other,
            })?;
        let response = check_status(response).await?;
        response
            .text()
            .await
            .map_err(|e| CallError::ScrapeUnavailable(format!("truncated page body: {}", e)))
    }
}

#[async_trait]
impl ProductScraper for HttpProductScraper {
    async fn fetch_product_specs(&self, url: &str) -> Result<ProductPage, CallError> {
        let base = Url::parse(url)
            .map_err(|e| CallError::MalformedRequest(format!("invalid product url '{}': {}", url, e)))?;

        let html = self.fetch_html(url).await?;
        let text = html_to_text(&html, self.max_text_chars);
        let images = select_images(&html, &base, &self.thumbnail_indices);
        info!("Scraped {}: {} chars of text, {} images", url, text.len(), images.len());
        if images.is_empty() {
            warn!("No product images found on {}", url);
        }

        let raw = self
            .generator
            .generate_text(&prompts::specs_extraction_prompt(&text), &[])
            .await?;
        let specs: ProductSpecs = extract_as(&raw, &ProductSpecs::schema())?;
        debug!("Structured specs: material={}, {} features", specs.material, specs.features.len());

        Ok(ProductPage { specs, images })
    }
}

// ── HTML reduction ───────────────────────────────────────────────────────

static RE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript|svg)\b.*?</(script|style|noscript|svg)\s*>").unwrap());
static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip markup and collapse whitespace, capped at `max_chars` characters.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let s = RE_SCRIPT.replace_all(html, " ");
    let s = RE_COMMENT.replace_all(&s, " ");
    let s = RE_TAG.replace_all(&s, " ");
    let s = decode_entities(&s);
    let s = RE_WS.replace_all(&s, " ");
    s.trim().chars().take(max_chars).collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// ── Image selection ──────────────────────────────────────────────────────

static RE_IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static RE_META: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());

fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let re = Regex::new(&format!(r#"(?i)\s{}\s*=\s*(?:"([^"]*)"|'([^']*)')"#, regex::escape(name))).ok()?;
    let caps = re.captures(tag)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
}

fn thumbnail_number(alt: &str) -> Option<usize> {
    let rest = alt.trim().strip_prefix("PDP Thumbnail Image")?;
    rest.trim().parse().ok()
}

/// Pick the reference images of a product page, in `indices` order.
pub fn select_images(html: &str, base: &Url, indices: &[usize]) -> Vec<ImageRef> {
    let thumbnails: Vec<(usize, &str)> = RE_IMG
        .find_iter(html)
        .filter_map(|m| {
            let tag = m.as_str();
            let n = thumbnail_number(attr(tag, "alt")?)?;
            let src = attr(tag, "src").or_else(|| attr(tag, "data-src"))?;
            Some((n, src))
        })
        .collect();

    let mut picked: Vec<ImageRef> = indices
        .iter()
        .filter_map(|i| thumbnails.iter().find(|(n, _)| n == i))
        .filter_map(|(_, src)| resolve(base, src))
        .collect();

    if picked.is_empty() {
        picked = RE_META
            .find_iter(html)
            .map(|m| m.as_str())
            .filter(|tag| attr(tag, "property").is_some_and(|p| p.eq_ignore_ascii_case("og:image")))
            .filter_map(|tag| attr(tag, "content"))
            .filter_map(|src| resolve(base, src))
            .take(1)
            .collect();
    }

    picked.dedup();
    picked
}

fn resolve(base: &Url, src: &str) -> Option<ImageRef> {
    let src = decode_entities(src.trim());
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    base.join(&src).ok().map(|u| ImageRef::new(u.to_string()))
}
