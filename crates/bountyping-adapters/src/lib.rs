//! Platform adapter contract + the HackerOne and ProjectDiscovery adapters.

use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bountyping_core::ProgramDraft;
use bountyping_storage::{HttpError, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const HACKERONE: &str = "hackerone";
pub const PROJECTDISCOVERY: &str = "projectdiscovery";
pub const SEED_FILE: &str = "seed-file";

pub const HACKERONE_GRAPHQL_URL: &str = "https://hackerone.com/graphql";
pub const PROJECTDISCOVERY_JSON_URL: &str =
    "https://raw.githubusercontent.com/projectdiscovery/public-bugbounty-programs/main/chaos-bugbounty-list.json";

const HACKERONE_MAX_PAGES: usize = 100;
const SEED_MAX_ASSETS: usize = 20;
const SEED_ASSET_TYPE_SAMPLE: usize = 10;

const HACKERONE_DIRECTORY_QUERY: &str = r#"
query DirectoryQuery($cursor: String) {
  teams(
    first: 100
    after: $cursor
    secure_order_by: {started_accepting_at: {_direction: DESC}}
    where: {state: {_eq: public_mode}}
  ) {
    pageInfo {
      endCursor
      hasNextPage
    }
    edges {
      node {
        id
        handle
        name
        currency
        state
        submission_state
        offers_bounties
        offers_swag
        base_bounty
        url
        started_accepting_at
      }
    }
  }
}
"#;

/// How an adapter obtains its listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    LiveApi,
    BulkSeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

/// Normalized entries from one fetch plus whatever could not be parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub entries: Vec<ProgramDraft>,
    pub skipped: usize,
    pub warnings: Vec<String>,
    /// Set when the source failed part-way and the entries are only a prefix.
    pub incomplete: bool,
}

impl FetchBatch {
    pub fn new(entries: Vec<ProgramDraft>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped += 1;
        self.warnings.push(reason.into());
    }

    pub fn absorb(&mut self, other: FetchBatch) {
        self.entries.extend(other.entries);
        self.skipped += other.skipped;
        self.warnings.extend(other.warnings);
        self.incomplete |= other.incomplete;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("malformed payload: {0}")]
    Parse(String),
    #[error("upstream reported errors: {0}")]
    Upstream(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One pluggable platform. `fetch` only reads; persistence belongs to the caller.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchBatch, FetchError>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn decode_body(platform: &str, body: &[u8]) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(body).map_err(|err| FetchError::Parse(format!("{platform}: {err}")))
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Amounts arrive as numbers or numeric strings depending on the API version.
fn json_amount(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

fn json_timestamp(value: &JsonValue, key: &str) -> Option<DateTime<Utc>> {
    json_str(value, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// One page of the HackerOne directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryPage {
    pub batch: FetchBatch,
    pub next_cursor: Option<String>,
}

pub fn parse_directory_page(value: &JsonValue, fetched_at: DateTime<Utc>) -> Result<DirectoryPage, FetchError> {
    if let Some(errors) = value.get("errors").filter(|e| !e.is_null()) {
        return Err(FetchError::Upstream(errors.to_string()));
    }

    let teams = value
        .pointer("/data/teams")
        .filter(|t| t.is_object())
        .ok_or_else(|| FetchError::Parse("hackerone: response has no data.teams".to_string()))?;

    let edges = teams
        .get("edges")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    let mut batch = FetchBatch::default();
    for (index, edge) in edges.iter().enumerate() {
        let Some(node) = edge.get("node").filter(|n| n.is_object()) else {
            batch.skip(format!("hackerone edge {index} has no node"));
            continue;
        };
        let Some(handle) = json_str(node, "handle") else {
            let id = json_str(node, "id").unwrap_or("?");
            batch.skip(format!("hackerone team {id} has no handle"));
            continue;
        };
        batch.entries.push(hackerone_draft(handle, node, fetched_at));
    }

    let has_next = teams
        .pointer("/pageInfo/hasNextPage")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next && !edges.is_empty() {
        teams
            .pointer("/pageInfo/endCursor")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
    } else {
        None
    };

    Ok(DirectoryPage { batch, next_cursor })
}

fn hackerone_draft(handle: &str, node: &JsonValue, fetched_at: DateTime<Utc>) -> ProgramDraft {
    let name = json_str(node, "name").unwrap_or(handle);
    let mut draft = ProgramDraft::new(
        HACKERONE,
        handle,
        name,
        format!("https://hackerone.com/{handle}"),
        fetched_at,
    );

    let offers_bounties = node
        .get("offers_bounties")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    draft.offers_bounties = offers_bounties;
    // base_bounty is a floor; the directory never exposes a ceiling.
    draft.bounty_min = json_amount(node, "base_bounty").filter(|v| *v > 0 && offers_bounties);
    if let Some(currency) = json_str(node, "currency") {
        draft.currency = currency.to_ascii_uppercase();
    }
    draft.accepts_submissions = json_str(node, "submission_state") == Some("open");
    draft.launched_at = json_timestamp(node, "started_accepting_at");
    draft.raw = Some(node.clone());
    draft
}

/// Live adapter over the public HackerOne GraphQL directory.
#[derive(Debug, Clone)]
pub struct HackerOneAdapter {
    endpoint: String,
    max_pages: usize,
}

impl Default for HackerOneAdapter {
    fn default() -> Self {
        Self {
            endpoint: HACKERONE_GRAPHQL_URL.to_string(),
            max_pages: HACKERONE_MAX_PAGES,
        }
    }
}

impl HackerOneAdapter {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PlatformAdapter for HackerOneAdapter {
    fn platform(&self) -> &str {
        HACKERONE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::LiveApi
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchBatch, FetchError> {
        paginate_directory(self.max_pages, |cursor| async move {
            let variables = match cursor {
                Some(after) => json!({ "cursor": after }),
                None => json!({}),
            };
            let body = json!({ "query": HACKERONE_DIRECTORY_QUERY, "variables": variables });
            let response = http.post_json(ctx.run_id, HACKERONE, &self.endpoint, &body).await?;
            parse_directory_page(&decode_body(HACKERONE, &response.body)?, ctx.fetched_at)
        })
        .await
    }
}

/// Follow directory cursors until the last page or `max_pages`. A failure on
/// the first page is an error; a later one keeps the pages already read and
/// marks the batch incomplete.
pub async fn paginate_directory<F, Fut>(max_pages: usize, mut fetch_page: F) -> Result<FetchBatch, FetchError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<DirectoryPage, FetchError>>,
{
    let mut batch = FetchBatch::default();
    let mut cursor: Option<String> = None;

    for page in 1..=max_pages {
        let parsed = match fetch_page(cursor.take()).await {
            Ok(parsed) => parsed,
            Err(err) if page == 1 => return Err(err),
            Err(err) => {
                warn!(page, error = %err, "hackerone directory page failed; keeping earlier pages");
                batch.warnings.push(format!("hackerone directory stopped at page {page}: {err}"));
                batch.incomplete = true;
                return Ok(batch);
            }
        };
        debug!(
            page,
            entries = parsed.batch.entries.len(),
            skipped = parsed.batch.skipped,
            "hackerone directory page"
        );

        batch.absorb(parsed.batch);
        match parsed.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(batch),
        }
    }

    warn!(max_pages, "hackerone directory truncated at page cap");
    batch
        .warnings
        .push(format!("hackerone directory truncated after {max_pages} pages"));
    Ok(batch)
}

/// Parse the chaos bug-bounty list (`{"programs": [...]}`) into drafts for
/// whatever platform each program lives on.
pub fn parse_chaos_list(value: &JsonValue, fetched_at: DateTime<Utc>) -> Result<FetchBatch, FetchError> {
    let programs = value
        .get("programs")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::Parse("seed list has no programs array".to_string()))?;

    let mut batch = FetchBatch::default();
    for (index, item) in programs.iter().enumerate() {
        if !item.is_object() {
            batch.skip(format!("seed entry {index} is not an object"));
            continue;
        }

        let name = json_str(item, "name").unwrap_or_default();
        let url = json_str(item, "url").unwrap_or_default();
        if name.is_empty() && url.is_empty() {
            batch.skip(format!("seed entry {index} has neither name nor url"));
            continue;
        }

        let slug = generate_slug(url, name);
        let display_name = if name.is_empty() { slug.as_str() } else { name };
        let mut draft = ProgramDraft::new(detect_platform(url), slug.clone(), display_name, url, fetched_at);

        let terms = match item.get("bounty") {
            Some(JsonValue::Bool(offered)) => BountyTerms {
                offers_bounties: *offered,
                ..BountyTerms::default()
            },
            Some(JsonValue::String(text)) => classify_bounty_text(text),
            _ => BountyTerms::default(),
        };
        draft.offers_bounties = terms.offers_bounties;
        draft.bounty_min = terms.min;
        draft.bounty_max = terms.max;

        let domains = item
            .get("domains")
            .and_then(JsonValue::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::trim))
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        draft.asset_types = detect_asset_types(&domains);
        draft.assets = domains.into_iter().take(SEED_MAX_ASSETS).collect();
        draft.raw = Some(item.clone());

        batch.entries.push(draft);
    }

    Ok(batch)
}

pub fn detect_platform(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() {
        return "unknown".to_string();
    }
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();

    let platform = if host.contains("hackerone.com") {
        "hackerone"
    } else if host.contains("bugcrowd.com") {
        "bugcrowd"
    } else if host.contains("intigriti.com") {
        "intigriti"
    } else if host.contains("yeswehack.com") {
        "yeswehack"
    } else if host.contains("immunefi.com") {
        "immunefi"
    } else if host.contains("code4rena.com") {
        "code4rena"
    } else if host.contains("huntr.dev") || host.contains("huntr.com") {
        "huntr"
    } else if host.contains("algora.io") {
        "algora"
    } else {
        "other"
    };
    platform.to_string()
}

/// Last path segment of the program URL, else the host, else the name;
/// always reduced to `[a-z0-9-]`.
pub fn generate_slug(url: &str, name: &str) -> String {
    let url = url.trim();
    let candidate = if url.is_empty() {
        name.to_string()
    } else {
        match Url::parse(url) {
            Ok(parsed) => parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(ToString::to_string)
                .or_else(|| parsed.host_str().map(|h| h.replace('.', "-")))
                .unwrap_or_else(|| name.to_string()),
            Err(_) => url
                .trim_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    };

    let slug = slugify(&candidate);
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BountyTerms {
    pub offers_bounties: bool,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Default for BountyTerms {
    fn default() -> Self {
        Self {
            offers_bounties: true,
            min: None,
            max: None,
        }
    }
}

/// Interpret free-form bounty text such as `"$500 - $25,000"`, `"yes"`, `"swag"`.
pub fn classify_bounty_text(text: &str) -> BountyTerms {
    let lower = text.to_ascii_lowercase();
    if lower.contains("yes") || lower.contains('$') {
        let amounts = extract_dollar_amounts(&lower);
        let (min, max) = match amounts.len() {
            0 => (None, None),
            1 => (None, amounts.first().copied()),
            _ => (amounts.iter().min().copied(), amounts.iter().max().copied()),
        };
        return BountyTerms {
            offers_bounties: true,
            min,
            max,
        };
    }
    if lower.contains("no") || lower.contains("swag") {
        return BountyTerms {
            offers_bounties: false,
            min: None,
            max: None,
        };
    }
    BountyTerms::default()
}

/// Whole-dollar amounts written as `$1,000` or `$500`.
pub fn extract_dollar_amounts(text: &str) -> Vec<i64> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        let mut digits = String::new();
        while j < chars.len() {
            let ch = chars[j];
            if ch.is_ascii_digit() {
                digits.push(ch);
            } else if ch == ',' && !digits.is_empty() && chars.get(j + 1).is_some_and(|c| c.is_ascii_digit()) {
                // thousands separator
            } else {
                break;
            }
            j += 1;
        }
        if let Ok(v) = digits.parse::<i64>() {
            out.push(v);
        }
        i = j;
    }
    out
}

pub fn detect_asset_types(domains: &[String]) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    for domain in domains.iter().take(SEED_ASSET_TYPE_SAMPLE) {
        let lower = domain.to_ascii_lowercase();
        if lower.contains("api.") || lower.contains("/api") {
            types.insert("api".to_string());
        }
        if ["android", "ios", "mobile", "app"].iter().any(|m| lower.contains(m)) {
            types.insert("mobile".to_string());
        }
        if lower.starts_with("http") || lower.contains('.') {
            types.insert("web".to_string());
        }
    }
    if types.is_empty() {
        types.insert("web".to_string());
    }
    types
}

/// Bulk seed from the published ProjectDiscovery list.
#[derive(Debug, Clone)]
pub struct ProjectDiscoveryAdapter {
    url: String,
}

impl ProjectDiscoveryAdapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for ProjectDiscoveryAdapter {
    fn default() -> Self {
        Self::new(PROJECTDISCOVERY_JSON_URL)
    }
}

#[async_trait]
impl PlatformAdapter for ProjectDiscoveryAdapter {
    fn platform(&self) -> &str {
        PROJECTDISCOVERY
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::BulkSeed
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchBatch, FetchError> {
        let response = http.get_bytes(ctx.run_id, PROJECTDISCOVERY, &self.url).await?;
        let batch = parse_chaos_list(&decode_body(PROJECTDISCOVERY, &response.body)?, ctx.fetched_at)?;
        debug!(entries = batch.entries.len(), skipped = batch.skipped, "projectdiscovery list parsed");
        Ok(batch)
    }
}

/// Offline seed: the ProjectDiscovery list format read from a local file.
#[derive(Debug, Clone)]
pub struct JsonFileSeedAdapter {
    path: PathBuf,
}

impl JsonFileSeedAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PlatformAdapter for JsonFileSeedAdapter {
    fn platform(&self) -> &str {
        SEED_FILE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::BulkSeed
    }

    async fn fetch(&self, _http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchBatch, FetchError> {
        let value: JsonValue = read_json_file(&self.path)?;
        parse_chaos_list(&value, ctx.fetched_at)
    }
}

/// Settings the registry needs to build adapters.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub projectdiscovery_url: String,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            projectdiscovery_url: PROJECTDISCOVERY_JSON_URL.to_string(),
        }
    }
}

pub fn known_platforms() -> &'static [&'static str] {
    &[HACKERONE, PROJECTDISCOVERY]
}

pub fn adapter_for_platform(platform: &str, options: &AdapterOptions) -> Option<Box<dyn PlatformAdapter>> {
    match platform {
        HACKERONE => Some(Box::new(HackerOneAdapter::default())),
        PROJECTDISCOVERY => Some(Box::new(ProjectDiscoveryAdapter::new(
            options.projectdiscovery_url.clone(),
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bountyping_storage::HttpClientConfig;
    use chrono::TimeZone;
    use std::io::Write;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(platform: &str, file: &str) -> JsonValue {
        read_json_file(workspace_root().join("fixtures").join(platform).join(file)).expect("fixture")
    }

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hackerone_page_normalizes_nodes_and_skips_missing_handles() {
        let page = parse_directory_page(&fixture("hackerone", "directory_page_1.json"), fetched_at()).unwrap();

        assert_eq!(page.next_cursor.as_deref(), Some("Y3Vyc29yOjM="));
        assert_eq!(page.batch.skipped, 1);
        assert!(page.batch.warnings[0].contains("no handle"));

        let slugs = page.batch.entries.iter().map(|d| d.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["acme", "opencity", "widgets"]);

        let acme = &page.batch.entries[0];
        assert_eq!(acme.platform, "hackerone");
        assert_eq!(acme.url, "https://hackerone.com/acme");
        assert_eq!(acme.bounty_min, Some(100));
        assert_eq!(acme.bounty_max, None);
        assert_eq!(acme.currency, "USD");
        assert!(acme.accepts_submissions);
        assert_eq!(
            acme.launched_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap())
        );
        assert_eq!(acme.fetched_at, fetched_at());

        let vdp = &page.batch.entries[1];
        assert!(!vdp.offers_bounties);
        assert_eq!(vdp.bounty_min, None);
        assert!(!vdp.accepts_submissions);
        assert_eq!(vdp.launched_at, None);

        let widgets = &page.batch.entries[2];
        assert_eq!(widgets.name, "widgets");
        assert_eq!(widgets.bounty_min, Some(250));
        assert_eq!(widgets.currency, "EUR");
    }

    #[test]
    fn hackerone_last_page_has_no_cursor() {
        let page = parse_directory_page(&fixture("hackerone", "directory_last_page.json"), fetched_at()).unwrap();
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.batch.entries.len(), 1);
        assert_eq!(page.batch.entries[0].bounty_min, None);
    }

    #[test]
    fn hackerone_graphql_errors_are_fetch_errors() {
        let err = parse_directory_page(&fixture("hackerone", "graphql_error.json"), fetched_at()).unwrap_err();
        assert!(matches!(err, FetchError::Upstream(ref msg) if msg.contains("base_bounty")));

        let err = parse_directory_page(&json!({"data": {}}), fetched_at()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[tokio::test]
    async fn directory_failure_after_first_page_keeps_collected_entries() {
        let first = parse_directory_page(&fixture("hackerone", "directory_page_1.json"), fetched_at()).unwrap();
        let expected = first.batch.entries.len();
        let mut pages = vec![Ok(first), Err(FetchError::Upstream("502 bad gateway".into()))].into_iter();
        let mut cursors = Vec::new();

        let batch = paginate_directory(10, |cursor| {
            cursors.push(cursor);
            let next = pages.next().expect("page requested past the script");
            async move { next }
        })
        .await
        .unwrap();

        assert_eq!(cursors, vec![None, Some("Y3Vyc29yOjM=".to_string())]);
        assert_eq!(batch.entries.len(), expected);
        assert!(batch.incomplete);
        assert!(batch.warnings.iter().any(|w| w.contains("page 2") && w.contains("502")));
    }

    #[tokio::test]
    async fn directory_failure_on_first_page_is_an_error() {
        let err = paginate_directory(10, |_| async { Err(FetchError::Upstream("503".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Upstream(_)));
    }

    #[tokio::test]
    async fn directory_pagination_stops_at_last_page() {
        let mut pages = vec![
            parse_directory_page(&fixture("hackerone", "directory_page_1.json"), fetched_at()),
            parse_directory_page(&fixture("hackerone", "directory_last_page.json"), fetched_at()),
        ]
        .into_iter();

        let batch = paginate_directory(10, |_| {
            let next = pages.next().expect("page requested past the script");
            async move { next }
        })
        .await
        .unwrap();

        assert!(!batch.incomplete);
        assert!(batch.entries.iter().any(|e| e.slug == "zeta"));
    }

    #[test]
    fn chaos_list_maps_every_program_to_its_platform() {
        let batch = parse_chaos_list(
            &fixture("projectdiscovery", "chaos-bugbounty-list.json"),
            fetched_at(),
        )
        .unwrap();

        assert_eq!(batch.entries.len(), 6);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.warnings.len(), 2);

        let keys = batch
            .entries
            .iter()
            .map(|d| (d.platform.as_str(), d.slug.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                ("hackerone", "acme"),
                ("bugcrowd", "crowd-widgets"),
                ("intigriti", "services"),
                ("yeswehack", "swag-only"),
                ("other", "security-selfhosted-example"),
                ("unknown", "no-link-program"),
            ]
        );

        let acme = &batch.entries[0];
        assert!(acme.offers_bounties);
        assert_eq!((acme.bounty_min, acme.bounty_max), (Some(500), Some(25000)));
        assert_eq!(acme.asset_types, set(&["api", "web"]));
        assert_eq!(acme.assets, vec!["acme.com", "api.acme.com"]);
        assert!(acme.raw.is_some());

        let widgets = &batch.entries[1];
        assert!(widgets.offers_bounties);
        assert_eq!(widgets.asset_types, set(&["mobile", "web"]));

        let city = &batch.entries[2];
        assert!(!city.offers_bounties);
        assert_eq!(city.asset_types, set(&["web"]));

        assert!(!batch.entries[3].offers_bounties);

        let self_hosted = &batch.entries[4];
        assert_eq!((self_hosted.bounty_min, self_hosted.bounty_max), (None, Some(10000)));

        let no_link = &batch.entries[5];
        assert!(no_link.offers_bounties);
        assert_eq!(no_link.url, "");
    }

    #[test]
    fn chaos_list_without_programs_array_is_a_parse_error() {
        let err = parse_chaos_list(&json!({"items": []}), fetched_at()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn seed_assets_are_capped() {
        let domains = (0..30).map(|i| format!("d{i}.example.com")).collect::<Vec<_>>();
        let value = json!({"programs": [{"name": "Big", "url": "https://bugcrowd.com/big", "domains": domains}]});
        let batch = parse_chaos_list(&value, fetched_at()).unwrap();
        assert_eq!(batch.entries[0].assets.len(), 20);
    }

    #[test]
    fn platform_detection_by_host() {
        assert_eq!(detect_platform("https://hackerone.com/acme"), "hackerone");
        assert_eq!(detect_platform("https://immunefi.com/bounty/foo"), "immunefi");
        assert_eq!(detect_platform("https://huntr.dev/repos/x"), "huntr");
        assert_eq!(detect_platform("https://example.com/security"), "other");
        assert_eq!(detect_platform(""), "unknown");
    }

    #[test]
    fn slug_generation() {
        assert_eq!(generate_slug("https://hackerone.com/Acme_Corp", "x"), "acme-corp");
        assert_eq!(generate_slug("https://bugcrowd.com/widgets/", "x"), "widgets");
        assert_eq!(generate_slug("https://secure.example.org", "x"), "secure-example-org");
        assert_eq!(generate_slug("", "  My Program!! "), "my-program");
        assert_eq!(generate_slug("", "!!!"), "unknown");
    }

    #[test]
    fn bounty_text_classification() {
        assert_eq!(
            classify_bounty_text("$100 - $1,500"),
            BountyTerms {
                offers_bounties: true,
                min: Some(100),
                max: Some(1500)
            }
        );
        assert_eq!(classify_bounty_text("Up to $5,000").max, Some(5000));
        assert_eq!(classify_bounty_text("Up to $5,000").min, None);
        assert!(classify_bounty_text("Yes").offers_bounties);
        assert!(!classify_bounty_text("No").offers_bounties);
        assert!(!classify_bounty_text("swag only").offers_bounties);
        assert!(classify_bounty_text("").offers_bounties);
    }

    #[test]
    fn dollar_amounts_honor_thousands_separators() {
        assert_eq!(extract_dollar_amounts("$1,000,000 max"), vec![1_000_000]);
        assert_eq!(extract_dollar_amounts("$50-$300, paid monthly"), vec![50, 300]);
        assert!(extract_dollar_amounts("no money").is_empty());
    }

    #[test]
    fn asset_types_default_to_web() {
        assert_eq!(detect_asset_types(&[]), set(&["web"]));
        assert_eq!(
            detect_asset_types(&["https://example.com/api/v1".to_string()]),
            set(&["api", "web"])
        );
        assert_eq!(detect_asset_types(&["com.example.ios".to_string()]), set(&["mobile", "web"]));
    }

    #[tokio::test]
    async fn json_file_seed_adapter_reads_local_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            json!({"programs": [{"name": "Local", "url": "https://intigriti.com/programs/local", "bounty": "yes"}]})
        )
        .unwrap();

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = JsonFileSeedAdapter::new(file.path());
        let batch = adapter.fetch(&http, &AdapterContext::new(fetched_at())).await.unwrap();

        assert_eq!(adapter.kind(), AdapterKind::BulkSeed);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].platform, "intigriti");
        assert_eq!(batch.entries[0].slug, "local");
    }

    #[tokio::test]
    async fn json_file_seed_adapter_missing_file_is_fetch_error() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = JsonFileSeedAdapter::new("/definitely/not/here.json");
        let err = adapter.fetch(&http, &AdapterContext::new(fetched_at())).await.unwrap_err();
        assert!(matches!(err, FetchError::Anyhow(_)));
    }

    #[test]
    fn registry_builds_known_platforms() {
        let options = AdapterOptions::default();
        for platform in known_platforms() {
            let adapter = adapter_for_platform(platform, &options).expect("registered");
            assert_eq!(adapter.platform(), *platform);
        }
        assert_eq!(
            adapter_for_platform(HACKERONE, &options).unwrap().kind(),
            AdapterKind::LiveApi
        );
        assert!(adapter_for_platform("bugcrowd", &options).is_none());
    }
}
