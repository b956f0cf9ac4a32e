//! Remote revision API: the [`RevisionSource`] seam and its MediaWiki implementation.
//!
//! The client speaks `action=query&prop=revisions&revids=...`. Responses are
//! accepted in both `formatversion=1` (pages keyed by page id) and
//! `formatversion=2` (pages as a list) shapes; chunk files are always written
//! back in the `formatversion=2` shape, tagged with the requested ID range.

use crate::config::{Credentials, USER_AGENT};
use crate::error::FetchError;
use crate::models::{ChunkResult, PageRevisions};
use crate::partition::IdRange;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Anything that can batch-query revisions by ID.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    async fn fetch_revisions(&self, ids: &[u64]) -> Result<ChunkResult, FetchError>;
}

#[derive(Deserialize)]
struct Envelope {
    /// Only present in chunk files
    #[serde(default)]
    ids: Option<IdRange>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    query: Option<QueryBody>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Deserialize)]
struct QueryBody {
    #[serde(default)]
    pages: Option<Pages>,
    #[serde(default)]
    badrevids: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Pages {
    List(Vec<PageRevisions>),
    Keyed(BTreeMap<String, PageRevisions>),
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    ids: IdRange,
    batchcomplete: bool,
    query: QueryOut<'a>,
}

#[derive(Serialize)]
struct QueryOut<'a> {
    pages: &'a [PageRevisions],
    #[serde(skip_serializing_if = "no_missing")]
    badrevids: &'a [u64],
}

fn no_missing(ids: &&[u64]) -> bool {
    ids.is_empty()
}

/// `badrevids` is an object keyed by revision id, or a plain list in chunk files.
fn missing_ids(value: &Value) -> Vec<u64> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, entry)| {
                key.parse()
                    .ok()
                    .or_else(|| entry.get("revid").and_then(Value::as_u64))
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_u64().or_else(|| item.get("revid").and_then(Value::as_u64)))
            .collect(),
        _ => Vec::new(),
    }
}

fn classify_api_error(code: String, info: String) -> FetchError {
    match code.as_str() {
        "ratelimited" | "maxlag" => FetchError::RateLimited,
        "readapidenied" | "notloggedin" | "assertuserfailed" | "assertbotfailed" => {
            FetchError::Auth(format!("{code}: {info}"))
        }
        _ => FetchError::Api { code, info },
    }
}

/// Parses a `prop=revisions` response body into a typed chunk result.
///
/// A body without a `query` section is malformed. A `query` without pages is
/// a legitimate empty chunk (every requested revision was missing).
pub fn parse_response(body: &str) -> Result<ChunkResult, FetchError> {
    parse_chunk(body).map(|(_, result)| result)
}

/// Like [`parse_response`], also returning the ID range a chunk file was
/// written for. Raw API responses carry no range.
pub fn parse_chunk(body: &str) -> Result<(Option<IdRange>, ChunkResult), FetchError> {
    if body.trim().is_empty() {
        return Err(FetchError::Malformed("empty body".to_string()));
    }
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if let Some(err) = envelope.error {
        return Err(classify_api_error(err.code, err.info));
    }
    let query = envelope
        .query
        .ok_or_else(|| FetchError::Malformed("response has no query section".to_string()))?;

    let pages = match query.pages {
        Some(Pages::List(pages)) => pages,
        Some(Pages::Keyed(pages)) => pages.into_values().collect(),
        None => Vec::new(),
    };
    let mut missing = query.badrevids.as_ref().map(missing_ids).unwrap_or_default();
    missing.sort_unstable();

    Ok((envelope.ids, ChunkResult { pages, missing }))
}

/// Serializes a chunk result in the `formatversion=2` response shape, plus
/// the ID range it was requested for.
pub fn encode_chunk(ids: IdRange, result: &ChunkResult) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&EnvelopeOut {
        ids,
        batchcomplete: true,
        query: QueryOut {
            pages: &result.pages,
            badrevids: &result.missing,
        },
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    query: TokenQuery,
}

#[derive(Deserialize)]
struct TokenQuery {
    tokens: LoginTokens,
}

#[derive(Deserialize)]
struct LoginTokens {
    logintoken: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    login: LoginOutcome,
}

#[derive(Deserialize)]
struct LoginOutcome {
    result: String,
    #[serde(default)]
    reason: Option<String>,
}

/// HTTP client for a MediaWiki `api.php` endpoint.
#[derive(Debug, Clone)]
pub struct MediaWikiClient {
    endpoint: String,
    http: reqwest::Client,
}

impl MediaWikiClient {
    pub fn new(
        endpoint: impl Into<String>,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            header_map.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(header_map)
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn revisions_query(ids: &[u64]) -> Vec<(&'static str, String)> {
        let revids = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("|");
        vec![
            ("action", "query".to_string()),
            ("format", "json".to_string()),
            ("formatversion", "2".to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "ids|user".to_string()),
            ("revids", revids),
        ]
    }

    /// Logs in with a bot password; the session cookie is kept for later requests.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), FetchError> {
        let body = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("action", "query"),
                ("meta", "tokens"),
                ("type", "login"),
                ("format", "json"),
                ("formatversion", "2"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Auth(format!("no login token in response: {e}")))?;

        let body = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("action", "login"),
                ("format", "json"),
                ("formatversion", "2"),
                ("lgname", credentials.username.as_str()),
                ("lgpassword", credentials.password.as_str()),
                ("lgtoken", token.query.tokens.logintoken.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let outcome: LoginResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Auth(format!("unexpected login response: {e}")))?;

        if outcome.login.result != "Success" {
            return Err(FetchError::Auth(format!(
                "{} ({})",
                outcome.login.result,
                outcome.login.reason.unwrap_or_default()
            )));
        }

        info!(user = %credentials.username, endpoint = %self.endpoint, "Logged in");
        Ok(())
    }
}

#[async_trait]
impl RevisionSource for MediaWikiClient {
    async fn fetch_revisions(&self, ids: &[u64]) -> Result<ChunkResult, FetchError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&Self::revisions_query(ids))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let result = parse_response(&body)?;
        debug!(
            first = ids.first().copied().unwrap_or(0),
            requested = ids.len(),
            revisions = result.revision_count(),
            missing = result.missing.len(),
            "Fetched revisions"
        );
        Ok(result)
    }
}
