//! Telemetry feed contracts, raw record shapes and the record normalizer.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use trailsync_core::{CanonicalRecord, FeedKind, IdentityKey};
use trailsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use url::Url;

pub const CRATE_NAME: &str = "trailsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{feed} unavailable: {message}")]
    Unavailable { feed: FeedKind, message: String },
    #[error("{feed} payload could not be parsed: {message}")]
    Parse { feed: FeedKind, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One feed source polled once per run.
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn feed(&self) -> FeedKind;

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SkybitzPosition {
    pub asset_id: Option<String>,
    pub mtsn: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
    pub address_street: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub address_country: Option<String>,
    pub address_postal: Option<String>,
    pub idle_duration: Option<String>,
    pub serial_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SamsaraAsset {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
    pub address: Option<String>,
}

/// One row of the Insight portal asset search, columns in page order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightAsset {
    pub asset_id: String,
    pub obs_time: String,
    pub serial_num: String,
    pub message_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub landmark: String,
    pub state: String,
    pub country: String,
    pub distance_from_landmark: String,
    pub address: String,
    pub quality: String,
    pub battery_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "feed", rename_all = "snake_case")]
pub enum RawRecord {
    Skybitz(SkybitzPosition),
    Samsara(SamsaraAsset),
    Insight(InsightAsset),
}

impl RawRecord {
    pub fn feed(&self) -> FeedKind {
        match self {
            RawRecord::Skybitz(_) => FeedKind::Skybitz,
            RawRecord::Samsara(_) => FeedKind::Samsara,
            RawRecord::Insight(_) => FeedKind::Insight,
        }
    }

    pub fn raw_identity(&self) -> Option<&str> {
        match self {
            RawRecord::Skybitz(p) => p.asset_id.as_deref(),
            RawRecord::Samsara(a) => a.name.as_deref(),
            RawRecord::Insight(a) => Some(a.asset_id.as_str()),
        }
    }

    pub fn device_serial(&self) -> Option<&str> {
        match self {
            RawRecord::Skybitz(p) => p.mtsn.as_deref(),
            RawRecord::Samsara(_) => None,
            RawRecord::Insight(a) => Some(a.serial_num.as_str()),
        }
    }
}

/// Raw identities (asset ids or device serials) that never enter the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ExclusionList(HashSet<String>);

impl ExclusionList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|s| s.into().trim().to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn excludes(&self, record: &RawRecord) -> bool {
        [record.raw_identity(), record.device_serial()]
            .into_iter()
            .flatten()
            .any(|id| self.0.contains(id.trim()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub key: IdentityKey,
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFeed {
    pub feed: FeedKind,
    pub fragments: Vec<Fragment>,
    pub excluded: usize,
    pub unkeyed: usize,
}

pub fn normalize_feed(feed: FeedKind, records: &[RawRecord], exclusions: &ExclusionList) -> NormalizedFeed {
    let mut fragments = Vec::with_capacity(records.len());
    let mut excluded = 0usize;
    let mut unkeyed = 0usize;

    for record in records {
        if exclusions.excludes(record) {
            excluded += 1;
            debug!(%feed, identity = ?record.raw_identity(), "excluded raw record");
            continue;
        }
        let Some(key) = record.raw_identity().and_then(IdentityKey::normalize) else {
            unkeyed += 1;
            warn!(%feed, "dropping record without a usable identity");
            continue;
        };
        fragments.push(Fragment {
            key,
            record: to_canonical(record),
        });
    }

    info!(%feed, fragments = fragments.len(), excluded, unkeyed, "normalized feed");
    NormalizedFeed {
        feed,
        fragments,
        excluded,
        unkeyed,
    }
}

/// Field mapping per feed. Fields a feed does not carry are set to `None` here.
pub fn to_canonical(record: &RawRecord) -> CanonicalRecord {
    match record {
        RawRecord::Skybitz(p) => CanonicalRecord {
            latitude: p.latitude,
            longitude: p.longitude,
            full_address: compose_address(&[
                p.address_street.as_deref(),
                p.address_city.as_deref(),
                p.address_state.as_deref(),
                p.address_postal.as_deref(),
            ]),
            address_street: p.address_street.clone(),
            address_city: p.address_city.clone(),
            address_state: p.address_state.clone(),
            address_country: p.address_country.clone(),
            address_postal: p.address_postal.clone(),
            idle_duration: p.idle_duration.clone(),
            serial_data: p.serial_data.clone(),
            observed_at: p.observed_at,
            remote_handle: None,
        },
        RawRecord::Samsara(a) => CanonicalRecord {
            latitude: a.latitude,
            longitude: a.longitude,
            full_address: a.address.clone(),
            address_street: None,
            address_city: None,
            address_state: a.address.as_deref().and_then(extract_us_state),
            address_country: None,
            address_postal: None,
            idle_duration: None,
            serial_data: None,
            observed_at: a.observed_at,
            remote_handle: None,
        },
        RawRecord::Insight(a) => CanonicalRecord {
            latitude: a.latitude,
            longitude: a.longitude,
            full_address: insight_address(a),
            address_street: None,
            address_city: None,
            address_state: non_empty(&a.state),
            address_country: None,
            address_postal: None,
            idle_duration: None,
            serial_data: None,
            observed_at: parse_eastern_timestamp(&a.obs_time),
            remote_handle: None,
        },
    }
}

fn compose_address(parts: &[Option<&str>]) -> Option<String> {
    let joined = parts
        .iter()
        .flatten()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    non_empty(&joined)
}

fn insight_address(asset: &InsightAsset) -> Option<String> {
    let address = asset.address.trim();
    if !address.is_empty() && !address.eq_ignore_ascii_case("n/a") {
        return Some(address.to_string());
    }
    compose_address(&[Some(asset.landmark.as_str()), Some(asset.state.as_str())])
}

static US_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|,\s*)(AL|AK|AZ|AR|CA|CO|CT|DE|FL|GA|HI|ID|IL|IN|IA|KS|KY|LA|ME|MD|MA|MI|MN|MS|MO|MT|NE|NV|NH|NJ|NM|NY|NC|ND|OH|OK|OR|PA|RI|SC|SD|TN|TX|UT|VT|VA|WA|WV|WI|WY)(?:,|$|\s\d{5})",
    )
    .expect("static state regex compiles")
});

/// Two-letter US state code from a free-form `"street, city, ST 12345"` address.
pub fn extract_us_state(address: &str) -> Option<String> {
    US_STATE
        .captures(address)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

const EASTERN_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%Y-%m-%d %H:%M:%S",
];

/// Portal timestamps are US Eastern wall-clock time, sometimes with a zone suffix.
pub fn parse_eastern_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    let without_zone = ["EST", "EDT", "ET"]
        .iter()
        .find_map(|zone| trimmed.strip_suffix(zone))
        .map(str::trim_end)
        .unwrap_or(trimmed);
    EASTERN_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(without_zone, fmt).ok()?;
        New_York
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn non_empty_opt(value: Option<String>) -> Option<String> {
    value.as_deref().and_then(non_empty)
}

fn parse_f64(value: Option<&str>) -> Option<f64> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzDocument {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    gls: Vec<SkybitzGls>,
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzGls {
    #[serde(default)]
    mtsn: Option<String>,
    #[serde(default)]
    asset: Option<SkybitzAssetXml>,
    #[serde(default)]
    latitude: Option<String>,
    #[serde(default)]
    longitude: Option<String>,
    #[serde(default, rename = "time-iso8601")]
    time_iso8601: Option<String>,
    #[serde(default)]
    address: Option<SkybitzAddressXml>,
    #[serde(default)]
    idle: Option<SkybitzIdleXml>,
    #[serde(default)]
    serial: Option<SkybitzSerialXml>,
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzAssetXml {
    #[serde(default)]
    assetid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzAddressXml {
    #[serde(default)]
    street: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    postal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzIdleXml {
    #[serde(default)]
    idleduration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SkybitzSerialXml {
    #[serde(default)]
    serialdata: Option<String>,
}

pub fn parse_skybitz_xml(xml: &str) -> Result<Vec<SkybitzPosition>, AdapterError> {
    let doc: SkybitzDocument = quick_xml::de::from_str(xml).map_err(|e| AdapterError::Parse {
        feed: FeedKind::Skybitz,
        message: e.to_string(),
    })?;

    if let Some(code) = doc.error.as_deref().map(str::trim) {
        if !code.is_empty() && code != "0" {
            return Err(AdapterError::Unavailable {
                feed: FeedKind::Skybitz,
                message: format!("feed reported error code {code}"),
            });
        }
    }

    Ok(doc
        .gls
        .into_iter()
        .map(|gls| {
            let address = gls.address.unwrap_or_default();
            SkybitzPosition {
                asset_id: non_empty_opt(gls.asset.and_then(|a| a.assetid)),
                mtsn: non_empty_opt(gls.mtsn),
                latitude: parse_f64(gls.latitude.as_deref()),
                longitude: parse_f64(gls.longitude.as_deref()),
                observed_at: gls
                    .time_iso8601
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
                    .map(|t| t.with_timezone(&Utc)),
                address_street: non_empty_opt(address.street),
                address_city: non_empty_opt(address.city),
                address_state: non_empty_opt(address.state),
                address_country: non_empty_opt(address.country),
                address_postal: non_empty_opt(address.postal),
                idle_duration: non_empty_opt(gls.idle.and_then(|i| i.idleduration)),
                serial_data: non_empty_opt(gls.serial.and_then(|s| s.serialdata)),
            }
        })
        .collect())
}

#[derive(Debug, Default, Deserialize)]
struct SamsaraResponse {
    #[serde(default)]
    assets: Vec<SamsaraAssetJson>,
}

#[derive(Debug, Default, Deserialize)]
struct SamsaraAssetJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Vec<SamsaraLocationJson>,
}

#[derive(Debug, Default, Deserialize)]
struct SamsaraLocationJson {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default, rename = "timeMs")]
    time_ms: Option<i64>,
    #[serde(default)]
    location: Option<String>,
}

pub fn parse_samsara_json(body: &[u8]) -> Result<Vec<SamsaraAsset>, AdapterError> {
    let response: SamsaraResponse = serde_json::from_slice(body).map_err(|e| AdapterError::Parse {
        feed: FeedKind::Samsara,
        message: e.to_string(),
    })?;

    Ok(response
        .assets
        .into_iter()
        .map(|asset| {
            let latest = asset.location.into_iter().next().unwrap_or_default();
            SamsaraAsset {
                name: non_empty_opt(asset.name),
                latitude: latest.latitude.filter(|v| v.is_finite()),
                longitude: latest.longitude.filter(|v| v.is_finite()),
                observed_at: latest.time_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                address: non_empty_opt(latest.location),
            }
        })
        .collect())
}

const INSIGHT_COLUMNS: usize = 13;

fn looks_like_asset_id(value: &str) -> bool {
    (6..=8).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit())
}

/// A session that was not accepted comes back as the login form.
pub fn looks_like_login_page(html: &str) -> bool {
    let lower = html.to_ascii_lowercase();
    lower.contains("password") && lower.contains("login")
}

pub fn parse_insight_html(html: &str) -> Result<Vec<InsightAsset>, AdapterError> {
    let parse_err = |message: &str| AdapterError::Parse {
        feed: FeedKind::Insight,
        message: message.to_string(),
    };

    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").map_err(|e| parse_err(&e.to_string()))?;
    let table_text = document
        .select(&table_sel)
        .map(|t| t.text().collect::<String>())
        .find(|text| {
            let lower = text.to_lowercase();
            lower.contains("asset id") && lower.contains("time of observation")
        })
        .ok_or_else(|| parse_err("asset results table not found"))?;

    let lines: Vec<String> = table_text
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect();

    let header_end = lines
        .iter()
        .position(|l| l.to_ascii_lowercase().contains("battery status"))
        .ok_or_else(|| parse_err("battery status header not found"))?;

    let mut assets = Vec::new();
    let mut start = header_end + 1;
    while start + INSIGHT_COLUMNS <= lines.len() {
        let g = &lines[start..start + INSIGHT_COLUMNS];
        if !looks_like_asset_id(&g[0]) {
            break;
        }
        assets.push(InsightAsset {
            asset_id: g[0].clone(),
            obs_time: g[1].clone(),
            serial_num: g[2].clone(),
            message_type: g[3].clone(),
            latitude: parse_f64(Some(&g[4])),
            longitude: parse_f64(Some(&g[5])),
            landmark: g[6].clone(),
            state: g[7].clone(),
            country: g[8].clone(),
            distance_from_landmark: g[9].clone(),
            address: g[10].clone(),
            quality: g[11].clone(),
            battery_status: g[12].clone(),
        });
        start += INSIGHT_COLUMNS;
    }
    Ok(assets)
}

#[derive(Debug, Clone)]
pub struct SkybitzAdapter {
    pub base_url: String,
    pub customer: String,
    pub password: String,
    pub version: String,
}

impl SkybitzAdapter {
    pub fn positions_url(&self) -> Result<Url, AdapterError> {
        let endpoint = format!("{}/QueryPositions", self.base_url.trim_end_matches('/'));
        Url::parse_with_params(
            &endpoint,
            [
                ("assetid", "ALL"),
                ("customer", self.customer.as_str()),
                ("password", self.password.as_str()),
                ("version", self.version.as_str()),
            ],
        )
        .map_err(|e| AdapterError::Unavailable {
            feed: FeedKind::Skybitz,
            message: format!("invalid feed url: {e}"),
        })
    }
}

#[async_trait]
impl FeedAdapter for SkybitzAdapter {
    fn feed(&self) -> FeedKind {
        FeedKind::Skybitz
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        let resp = http.get(self.positions_url()?.as_str(), None).await?;
        let positions = parse_skybitz_xml(&resp.text())?;
        Ok(positions.into_iter().map(RawRecord::Skybitz).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SamsaraAdapter {
    pub url: String,
    pub api_token: String,
}

#[async_trait]
impl FeedAdapter for SamsaraAdapter {
    fn feed(&self) -> FeedKind {
        FeedKind::Samsara
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        let resp = http.get(&self.url, Some(&self.api_token)).await?;
        let assets = parse_samsara_json(&resp.body)?;
        Ok(assets.into_iter().map(RawRecord::Samsara).collect())
    }
}

pub const INSIGHT_ORIGIN: &str = "https://insight.skybitz.com";
pub const INSIGHT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";
pub const INSIGHT_LOGIN_URL: &str = "https://insight.skybitz.com/CheckAccess";
pub const INSIGHT_LOGIN_REFERER: &str = "https://insight.skybitz.com/login.jsp";
pub const INSIGHT_SEARCH_URL: &str = "https://insight.skybitz.com/LAABSearch?event=menuSearchAssets&requestorUrl=/LAABSearch?event=menustartsearch&dispatchTo=/LocateAssets/NewAdvAssetSearchResults.jsp&map=no&optMulTerminal=AllGroups";
pub const INSIGHT_SEARCH_REFERER: &str = "https://insight.skybitz.com/LAABSearch?event=menustartsearch&dispatchTo=/LocateAssets/AssetBasedSearchAssetsMultiple.jsp";

const INSIGHT_SORT_FIELDS: &str =
    "0|Select A Field|asset_id|Asset Id|distance|Distance|obs_time|Observation Time|serial_num|MT S/N|";
const INSIGHT_SORT_ORDERS: &str = "asc|Ascending|desc|Descending|";

fn insight_search_form() -> Vec<(&'static str, &'static str)> {
    vec![
        ("pgnav", ""),
        ("chkSortOrderApplication", "on"),
        ("groupName", ""),
        ("assetIds", ""),
        ("mtsns", ""),
        ("mtids", ""),
        ("optSearchType", ""),
        ("recentNessOperator", ""),
        ("timeperiod", ""),
        ("hsortField1List", INSIGHT_SORT_FIELDS),
        ("hsortOrder1List", INSIGHT_SORT_ORDERS),
        ("hsortField2List", INSIGHT_SORT_FIELDS),
        ("hsortOrder2List", INSIGHT_SORT_ORDERS),
        ("hsortField3List", INSIGHT_SORT_FIELDS),
        ("hsortOrder3List", INSIGHT_SORT_ORDERS),
        ("sortField1", "asset_id"),
        ("sortField2", "obs_time"),
        ("sortField3", "serial_num"),
        ("sortOrder1", "asc"),
        ("sortOrder2", "desc"),
        ("sortOrder3", "asc"),
    ]
}

/// Portal scraper; every fetch logs in again on a fresh cookie session.
#[derive(Debug, Clone)]
pub struct InsightAdapter {
    pub username: String,
    pub password: String,
    pub login_url: String,
    pub search_url: String,
    pub http_config: HttpClientConfig,
}

impl InsightAdapter {
    pub fn new(username: impl Into<String>, password: impl Into<String>, http_config: HttpClientConfig) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            login_url: INSIGHT_LOGIN_URL.to_string(),
            search_url: INSIGHT_SEARCH_URL.to_string(),
            http_config,
        }
    }

    /// The portal only accepts browser-like form posts on a cookie session.
    pub fn session_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            cookie_store: true,
            user_agent: Some(INSIGHT_USER_AGENT.to_string()),
            origin: Some(INSIGHT_ORIGIN.to_string()),
            ..self.http_config.clone()
        }
    }
}

#[async_trait]
impl FeedAdapter for InsightAdapter {
    fn feed(&self) -> FeedKind {
        FeedKind::Insight
    }

    async fn fetch(&self, _http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        let session = HttpFetcher::new(self.session_config())?;

        let login_form = [
            ("strUserName", self.username.as_str()),
            ("strPassword", self.password.as_str()),
            ("go", "GO"),
        ];
        let login = session
            .post_form(&self.login_url, &login_form, Some(INSIGHT_LOGIN_REFERER))
            .await?;
        debug!(status = %login.status, "insight login posted");

        let search = session
            .post_form(&self.search_url, &insight_search_form(), Some(INSIGHT_SEARCH_REFERER))
            .await?;
        let html = search.text();
        if looks_like_login_page(&html) {
            return Err(AdapterError::Unavailable {
                feed: FeedKind::Insight,
                message: "asset search returned the login page".to_string(),
            });
        }

        let assets = parse_insight_html(&html)?;
        Ok(assets.into_iter().map(RawRecord::Insight).collect())
    }
}

/// Replays a captured payload from disk instead of calling the live feed.
#[derive(Debug, Clone)]
pub struct FixtureFeedAdapter {
    pub feed: FeedKind,
    pub path: PathBuf,
}

#[async_trait]
impl FeedAdapter for FixtureFeedAdapter {
    fn feed(&self) -> FeedKind {
        self.feed
    }

    async fn fetch(&self, _http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(load_feed_fixture(self.feed, &self.path)?)
    }
}

/// Conventional fixture file for a feed under `root`: `<feed>/sample.<ext>`.
pub fn fixture_path(root: impl AsRef<Path>, feed: FeedKind) -> PathBuf {
    let file = match feed {
        FeedKind::Skybitz => "sample.xml",
        FeedKind::Samsara => "sample.json",
        FeedKind::Insight => "sample.html",
    };
    root.as_ref().join(feed.as_str()).join(file)
}

pub fn load_feed_fixture(feed: FeedKind, path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let records = match feed {
        FeedKind::Skybitz => parse_skybitz_xml(&String::from_utf8_lossy(&bytes))
            .map(|v| v.into_iter().map(RawRecord::Skybitz).collect()),
        FeedKind::Samsara => parse_samsara_json(&bytes).map(|v| v.into_iter().map(RawRecord::Samsara).collect()),
        FeedKind::Insight => parse_insight_html(&String::from_utf8_lossy(&bytes))
            .map(|v| v.into_iter().map(RawRecord::Insight).collect()),
    };
    records.with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixtures_root() -> PathBuf {
        workspace_root().join("fixtures")
    }

    #[test]
    fn skybitz_fixture_parses_nested_fields() {
        let records = load_feed_fixture(FeedKind::Skybitz, fixture_path(fixtures_root(), FeedKind::Skybitz)).unwrap();
        assert_eq!(records.len(), 3);
        let RawRecord::Skybitz(first) = &records[0] else {
            panic!("expected skybitz record");
        };
        assert_eq!(first.asset_id.as_deref(), Some("5301"));
        assert_eq!(first.latitude, Some(37.5407));
        assert_eq!(first.longitude, Some(-77.436));
        assert_eq!(first.address_state.as_deref(), Some("VA"));
        assert_eq!(first.idle_duration.as_deref(), Some("2 hours"));
        assert_eq!(first.serial_data.as_deref(), Some("door=closed"));
        assert_eq!(
            first.observed_at,
            Some(Utc.with_ymd_and_hms(2025, 11, 3, 19, 7, 0).single().unwrap())
        );
        let RawRecord::Skybitz(second) = &records[1] else {
            panic!("expected skybitz record");
        };
        assert_eq!(second.latitude, None, "blank latitude null-propagates");
        assert_eq!(second.address_street, None);
    }

    #[test]
    fn skybitz_error_code_is_reported_as_unavailable() {
        let err = parse_skybitz_xml("<skybitz><error>97</error></skybitz>").unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { feed: FeedKind::Skybitz, .. }));
    }

    #[test]
    fn samsara_fixture_uses_first_location_sample() {
        let records = load_feed_fixture(FeedKind::Samsara, fixture_path(fixtures_root(), FeedKind::Samsara)).unwrap();
        assert_eq!(records.len(), 2);
        let RawRecord::Samsara(first) = &records[0] else {
            panic!("expected samsara record");
        };
        assert_eq!(first.name.as_deref(), Some("TRL# 5302"));
        assert_eq!(first.latitude, Some(35.2271));
        assert_eq!(
            first.observed_at,
            Some(Utc.timestamp_millis_opt(1_762_196_820_000).single().unwrap())
        );
    }

    #[test]
    fn insight_fixture_reads_fixed_width_groups_until_non_id() {
        let records = load_feed_fixture(FeedKind::Insight, fixture_path(fixtures_root(), FeedKind::Insight)).unwrap();
        assert_eq!(records.len(), 2);
        let RawRecord::Insight(first) = &records[0] else {
            panic!("expected insight record");
        };
        assert_eq!(first.asset_id, "5303001");
        assert_eq!(first.obs_time, "11/03/2025 14:07:00");
        assert_eq!(first.latitude, Some(40.7128));
        assert_eq!(first.address, "n/a");
        assert_eq!(first.battery_status, "Good");
    }

    #[test]
    fn insight_without_results_table_is_a_parse_error() {
        let err = parse_insight_html("<html><body><table><tr><td>Nothing</td></tr></table></body></html>").unwrap_err();
        assert!(matches!(err, AdapterError::Parse { feed: FeedKind::Insight, .. }));
    }

    #[test]
    fn insight_table_headers_match_regardless_of_case() {
        let cells = [
            "1234567", "11/03/2025 09:15:00", "MT99", "Position", "39.1", "-76.6", "Baltimore Yard", "MD",
            "US", "0.2 mi", "1 Port Rd", "Good", "OK",
        ];
        let rows: String = cells.iter().map(|c| format!("<td>{c}</td>\n")).collect();
        let html = format!(
            "<table>\n<tr><th>ASSET ID</th><th>TIME OF OBSERVATION</th><th>BATTERY STATUS</th></tr>\n<tr>\n{rows}</tr>\n</table>"
        );

        let assets = parse_insight_html(&html).unwrap();

        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].asset_id, "1234567");
        assert_eq!(assets[0].landmark, "Baltimore Yard");
    }

    #[test]
    fn insight_session_posts_like_the_portal_browser() {
        let adapter = InsightAdapter::new("user", "secret", HttpClientConfig::default());
        let config = adapter.session_config();
        assert!(config.cookie_store);
        assert_eq!(config.origin.as_deref(), Some(INSIGHT_ORIGIN));
        assert_eq!(config.user_agent.as_deref(), Some(INSIGHT_USER_AGENT));
        assert!(HttpFetcher::new(config).is_ok());
    }

    #[test]
    fn login_page_detection() {
        assert!(looks_like_login_page("<form>Login<input name=password></form>"));
        assert!(!looks_like_login_page("<table>Asset ID</table>"));
    }

    #[test]
    fn skybitz_mapping_composes_address_and_keeps_idle() {
        let record = RawRecord::Skybitz(SkybitzPosition {
            asset_id: Some("5301".into()),
            address_street: Some("100 Main St".into()),
            address_city: Some("Richmond".into()),
            address_state: Some("VA".into()),
            address_postal: Some("23219".into()),
            idle_duration: Some("3 days".into()),
            ..Default::default()
        });
        let canonical = to_canonical(&record);
        assert_eq!(canonical.full_address.as_deref(), Some("100 Main St, Richmond, VA, 23219"));
        assert_eq!(canonical.idle_duration.as_deref(), Some("3 days"));
        assert_eq!(canonical.remote_handle, None);
    }

    #[test]
    fn samsara_mapping_nulls_fields_it_never_supplies() {
        let record = RawRecord::Samsara(SamsaraAsset {
            name: Some("TRL#77".into()),
            latitude: Some(1.0),
            longitude: Some(2.0),
            observed_at: None,
            address: Some("12 Oak Rd, Charlotte, NC 28202".into()),
        });
        let canonical = to_canonical(&record);
        assert_eq!(canonical.address_state.as_deref(), Some("NC"));
        assert_eq!(canonical.idle_duration, None);
        assert_eq!(canonical.serial_data, None);
        assert_eq!(canonical.address_street, None);
    }

    #[test]
    fn insight_mapping_falls_back_to_landmark_and_parses_eastern_time() {
        let record = RawRecord::Insight(InsightAsset {
            asset_id: "5303001".into(),
            obs_time: "11/03/2025 14:07:00".into(),
            landmark: "Newark Yard".into(),
            state: "NJ".into(),
            address: "n/a".into(),
            ..Default::default()
        });
        let canonical = to_canonical(&record);
        assert_eq!(canonical.full_address.as_deref(), Some("Newark Yard, NJ"));
        assert_eq!(canonical.address_state.as_deref(), Some("NJ"));
        // EST is UTC-5 on Nov 3.
        assert_eq!(
            canonical.observed_at,
            Some(Utc.with_ymd_and_hms(2025, 11, 3, 19, 7, 0).single().unwrap())
        );
    }

    #[test]
    fn state_extraction_requires_a_delimited_code() {
        assert_eq!(extract_us_state("1 Elm St, Austin, TX 78701").as_deref(), Some("TX"));
        assert_eq!(extract_us_state("Richmond, VA").as_deref(), Some("VA"));
        assert_eq!(extract_us_state("VA, USA").as_deref(), Some("VA"));
        assert_eq!(extract_us_state("Vancouver, BC"), None);
        assert_eq!(extract_us_state(""), None);
    }

    #[test]
    fn eastern_timestamps_accept_zone_suffixes() {
        let expected = Utc.with_ymd_and_hms(2025, 7, 1, 16, 30, 0).single();
        assert_eq!(parse_eastern_timestamp("07/01/2025 12:30:00 EDT"), expected);
        assert_eq!(parse_eastern_timestamp("07/01/2025 12:30 PM"), expected);
        assert_eq!(parse_eastern_timestamp("not a time"), None);
    }

    #[test]
    fn exclusions_drop_by_serial_or_identity() {
        let exclusions = ExclusionList::new(["SHB7BJBL231902665", "9999"]);
        let records = vec![
            RawRecord::Skybitz(SkybitzPosition {
                asset_id: Some("5301".into()),
                mtsn: Some("SHB7BJBL231902665".into()),
                ..Default::default()
            }),
            RawRecord::Skybitz(SkybitzPosition {
                asset_id: Some("9999".into()),
                ..Default::default()
            }),
            RawRecord::Skybitz(SkybitzPosition {
                asset_id: Some(" 5302 ".into()),
                ..Default::default()
            }),
            RawRecord::Skybitz(SkybitzPosition::default()),
        ];

        let normalized = normalize_feed(FeedKind::Skybitz, &records, &exclusions);

        assert_eq!(normalized.excluded, 2);
        assert_eq!(normalized.unkeyed, 1);
        assert_eq!(normalized.fragments.len(), 1);
        assert_eq!(normalized.fragments[0].key.as_str(), "5302");
    }

    #[test]
    fn positions_url_encodes_credentials() {
        let adapter = SkybitzAdapter {
            base_url: "https://xml.example:9443/".into(),
            customer: "acme co".into(),
            password: "p&ss".into(),
            version: "2.74".into(),
        };
        assert_eq!(
            adapter.positions_url().unwrap().as_str(),
            "https://xml.example:9443/QueryPositions?assetid=ALL&customer=acme+co&password=p%26ss&version=2.74"
        );
    }

    #[tokio::test]
    async fn fixture_adapter_replays_recorded_payload() {
        let adapter = FixtureFeedAdapter {
            feed: FeedKind::Samsara,
            path: fixture_path(fixtures_root(), FeedKind::Samsara),
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let records = adapter.fetch(&http).await.unwrap();
        assert!(records.iter().all(|r| r.feed() == FeedKind::Samsara));
        assert_eq!(records.len(), 2);
    }
}
