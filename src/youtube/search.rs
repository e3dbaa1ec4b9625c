use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tracing::{debug, info};

use crate::error::PipelineError;

const SEARCH_URL: &str = "https://www.youtube.com/results";
/// `sp` value of the "Shorts" search filter.
const SHORTS_FILTER: &str = "EgkSB3lvdXR1YmUu";
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

static SHORTS_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/shorts/([A-Za-z0-9_-]{11})").expect("valid shorts regex"));

pub fn short_url(id: &str) -> String {
    format!("https://www.youtube.com/shorts/{id}")
}

/// Fetch the Shorts search page for `query` and return its HTML.
pub async fn fetch_search_page(client: &Client, query: &str) -> Result<String, PipelineError> {
    info!("Searching YouTube Shorts for '{}'", query);
    let page = client
        .get(SEARCH_URL)
        .query(&[("search_query", query), ("sp", SHORTS_FILTER)])
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    debug!("Search page is {} bytes", page.len());
    Ok(page)
}

/// Short ids in page order, de-duplicated, keeping only those `keep` accepts,
/// at most `limit`.
pub fn extract_short_ids(page: &str, limit: usize, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for cap in SHORTS_LINK.captures_iter(page) {
        if ids.len() >= limit {
            break;
        }
        let id = &cap[1];
        if ids.iter().any(|seen| seen == id) || !keep(id) {
            continue;
        }
        ids.push(id.to_string());
    }
    ids
}
