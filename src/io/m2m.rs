//! Client for the USGS machine-to-machine (M2M) JSON API.
//!
//! A query walks the dataset-search, scene-search, download-options and
//! download-request endpoints in that order and yields download URLs.

use crate::config::{retry_delay, ClientConfig};
use crate::report::StatusReporter;
use crate::types::{DownloadDescriptor, DownloadUrl, FinderError, FinderResult, LonLat, SceneRecord};
use chrono::{Local, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// Response body shared by every endpoint: a `data` payload or an error code
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error_code: Option<Value>,
    /// Older endpoints report the code under `errCode`
    #[serde(default, rename = "errCode")]
    pub err_code: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ApiEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            error_code: Some(Value::String(code.to_string())),
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Collapse into success-with-data or a `Query` failure for `endpoint`
    pub fn into_result(self, endpoint: &str) -> FinderResult<Value> {
        match self.error_code.or(self.err_code) {
            Some(code) => Err(FinderError::Query {
                endpoint: endpoint.to_string(),
                code: match code {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                message: self.error_message.unwrap_or_default(),
            }),
            None => Ok(self.data),
        }
    }
}

/// Carries one JSON request to a logical endpoint and returns the decoded envelope
pub trait Transport: Send + Sync {
    fn post(
        &self,
        endpoint: &str,
        body: Value,
        token: Option<&str>,
    ) -> impl Future<Output = FinderResult<ApiEnvelope>> + Send;
}

/// HTTPS transport with per-request timeout and exponential backoff
pub struct HttpTransport {
    client: reqwest::Client,
    base: reqwest::Url,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> FinderResult<Self> {
        let mut endpoint = config.endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base = reqwest::Url::parse(&endpoint)
            .map_err(|e| FinderError::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent("methane-finder/0.2.0")
            .build()?;

        Ok(Self {
            client,
            base,
            max_retries: config.max_retries,
        })
    }
}

impl Transport for HttpTransport {
    async fn post(
        &self,
        endpoint: &str,
        body: Value,
        token: Option<&str>,
    ) -> FinderResult<ApiEnvelope> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| FinderError::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                log::warn!("Retrying {} in {:?} (attempt {})", endpoint, delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url.clone()).json(&body);
            if let Some(token) = token {
                request = request.header("X-Auth-Token", token);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(FinderError::Query {
                        endpoint: endpoint.to_string(),
                        code: response.status().as_u16().to_string(),
                        message: response
                            .status()
                            .canonical_reason()
                            .unwrap_or("server error")
                            .to_string(),
                    });
                }
                Ok(response) => return Ok(response.json::<ApiEnvelope>().await?),
                Err(e) if e.is_timeout() || e.is_connect() => last_error = Some(e.into()),
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FinderError::Processing(format!("{} failed after all retries", endpoint))
        }))
    }
}

/// Authenticated session against the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub endpoint: String,
}

/// Search parameters; defaults come from [`ClientConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub dataset: String,
    /// Scenes with cloud cover strictly above this percentage are dropped
    pub cloud_cover: f64,
    /// Single point used as a degenerate bounding box
    pub lonlat: LonLat,
    pub month: u32,
    pub year: i32,
    pub max_return: u32,
}

impl QueryFilter {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            dataset: config.dataset.clone(),
            cloud_cover: config.cloud_cover,
            lonlat: config.lonlat,
            month: config.month,
            year: config.year,
            max_return: config.max_return,
        }
    }

    pub fn with_dataset(mut self, dataset: &str) -> Self {
        self.dataset = dataset.to_string();
        self
    }

    pub fn with_cloud_cover(mut self, cloud_cover: f64) -> Self {
        self.cloud_cover = cloud_cover;
        self
    }

    pub fn with_lonlat(mut self, lon: f64, lat: f64) -> Self {
        self.lonlat = LonLat::new(lon, lat);
        self
    }

    pub fn with_month(mut self, month: u32, year: i32) -> Self {
        self.month = month;
        self.year = year;
        self
    }

    pub fn with_max_return(mut self, max_return: u32) -> Self {
        self.max_return = max_return;
        self
    }

    /// First and last calendar day of the target month
    pub fn month_range(&self) -> FinderResult<(NaiveDate, NaiveDate)> {
        let invalid = || {
            FinderError::Config(format!("Invalid month/year: {}/{}", self.month, self.year))
        };

        let start = NaiveDate::from_ymd_opt(self.year, self.month, 1).ok_or_else(invalid)?;
        let next = if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        }
        .ok_or_else(invalid)?;
        let end = next.pred_opt().ok_or_else(invalid)?;

        Ok((start, end))
    }
}

/// URLs gathered by a query plus the per-dataset conditions that cut it short
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub urls: Vec<DownloadUrl>,
    /// `Query` and `Unsupported` errors; URLs gathered before them are kept
    pub failures: Vec<FinderError>,
}

impl QueryOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn unsupported(&self) -> impl Iterator<Item = &FinderError> {
        self.failures
            .iter()
            .filter(|e| matches!(e, FinderError::Unsupported(_)))
    }
}

#[derive(Debug, Clone, Serialize)]
struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpatialFilter {
    filter_type: &'static str,
    lower_left: Coordinate,
    upper_right: Coordinate,
}

impl SpatialFilter {
    /// Minimum bounding rectangle collapsed to a single point
    fn point(lonlat: LonLat) -> Self {
        let corner = Coordinate {
            latitude: lonlat.lat,
            longitude: lonlat.lon,
        };
        Self {
            filter_type: "mbr",
            lower_left: corner.clone(),
            upper_right: corner,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TemporalFilter {
    start: String,
    end: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetSearchRequest<'a> {
    dataset_name: &'a str,
    spatial_filter: &'a SpatialFilter,
    temporal_filter: &'a TemporalFilter,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SceneFilter<'a> {
    spatial_filter: &'a SpatialFilter,
    acquisition_filter: &'a TemporalFilter,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SceneSearchRequest<'a> {
    dataset_name: &'a str,
    max_results: u32,
    scene_filter: SceneFilter<'a>,
    starting_number: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadOptionsRequest<'a> {
    dataset_name: &'a str,
    entity_ids: Vec<String>,
}

#[derive(Serialize)]
struct DownloadRequest {
    downloads: Vec<DownloadDescriptor>,
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetRecord {
    dataset_alias: String,
    #[serde(default)]
    collection_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SceneSearchData {
    records_returned: u32,
    results: Vec<SceneRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadOption {
    id: String,
    entity_id: String,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct AvailableDownload {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DownloadRequestData {
    available_downloads: Vec<AvailableDownload>,
    preparing_downloads: Option<Vec<Value>>,
}

const LOGIN: &str = "login-token";
const LOGOUT: &str = "logout";
const DATASET_SEARCH: &str = "dataset-search";
const SCENE_SEARCH: &str = "scene-search";
const DOWNLOAD_OPTIONS: &str = "download-options";
const DOWNLOAD_REQUEST: &str = "download-request";

/// Remote catalog client; at most one session per instance
pub struct RemoteCatalogClient<T: Transport = HttpTransport> {
    transport: T,
    config: ClientConfig,
    session: Option<Session>,
    reporter: StatusReporter,
}

impl RemoteCatalogClient<HttpTransport> {
    pub fn new(config: ClientConfig) -> FinderResult<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> RemoteCatalogClient<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            session: None,
            reporter: StatusReporter::new(),
        }
    }

    pub fn set_reporter(&mut self, reporter: StatusReporter) {
        self.reporter = reporter;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn default_filter(&self) -> QueryFilter {
        QueryFilter::from_config(&self.config)
    }

    /// Exchange a (username, application token) pair for a session token.
    ///
    /// A rejected login leaves the client unauthenticated and reports `Auth`.
    pub async fn login(&mut self, username: &str, token: &str) -> FinderResult<()> {
        self.reporter.info("logging in...");
        self.session = None;

        let body = serde_json::to_value(LoginRequest { username, token })?;
        let envelope = self.transport.post(LOGIN, body, None).await?;

        let data = envelope.into_result(LOGIN).map_err(|e| {
            self.reporter.warn(" failed to set API key");
            match e {
                FinderError::Query { code, message, .. } => {
                    FinderError::Auth(format!("{}: {}", code, message))
                }
                other => other,
            }
        })?;

        let api_key = data
            .as_str()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| FinderError::Auth("login response carried no token".to_string()))?;

        self.session = Some(Session {
            token: api_key.to_string(),
            endpoint: self.config.endpoint.clone(),
        });
        Ok(())
    }

    /// Notify the server (best effort), then drop the local session
    pub async fn logout(&mut self) {
        self.reporter.info("logging out...");
        if let Some(session) = self.session.take() {
            let result = self
                .transport
                .post(LOGOUT, Value::Null, Some(&session.token))
                .await
                .and_then(|envelope| envelope.into_result(LOGOUT));
            if let Err(e) = result {
                self.reporter.debug(&format!(" logout notification failed: {}", e));
            }
        }
    }

    /// Run the full search protocol and collect download URLs.
    ///
    /// Per-dataset failures are recorded in [`QueryOutcome::failures`] and do
    /// not discard URLs gathered from earlier datasets.
    pub async fn query(&self, filter: &QueryFilter) -> FinderResult<QueryOutcome> {
        let session = self.session.as_ref().ok_or_else(|| {
            self.reporter.warn("Not logged into USGS M2M");
            FinderError::NotAuthenticated
        })?;

        let (start, end) = filter.month_range()?;
        self.reporter.info(&format!(
            "querying:\n location[{}, {}]\n year:{}\n month:{}",
            filter.lonlat.lon, filter.lonlat.lat, filter.year, filter.month
        ));

        let spatial = SpatialFilter::point(filter.lonlat);
        let temporal = TemporalFilter {
            start: start.format("%Y-%m-%d").to_string(),
            end: end.format("%Y-%m-%d").to_string(),
        };

        let body = serde_json::to_value(DatasetSearchRequest {
            dataset_name: &filter.dataset,
            spatial_filter: &spatial,
            temporal_filter: &temporal,
        })?;
        let datasets: Vec<DatasetRecord> = self.call(&session.token, DATASET_SEARCH, body).await?;

        let mut outcome = QueryOutcome::default();
        for dataset in datasets {
            if dataset.dataset_alias != filter.dataset {
                self.reporter
                    .debug(&format!(" skipping dataset {}", dataset.dataset_alias));
                continue;
            }
            self.reporter.info(
                dataset
                    .collection_name
                    .as_deref()
                    .unwrap_or(&dataset.dataset_alias),
            );

            if let Err(e) = self
                .query_dataset(&session.token, filter, &dataset, &spatial, &temporal, &mut outcome)
                .await
            {
                self.reporter.warn(&format!(" {}", e));
                outcome.failures.push(e);
            }
        }

        self.reporter
            .info(&format!("{} download URL(s) found", outcome.urls.len()));
        Ok(outcome)
    }

    async fn query_dataset(
        &self,
        token: &str,
        filter: &QueryFilter,
        dataset: &DatasetRecord,
        spatial: &SpatialFilter,
        temporal: &TemporalFilter,
        outcome: &mut QueryOutcome,
    ) -> FinderResult<()> {
        let body = serde_json::to_value(SceneSearchRequest {
            dataset_name: &filter.dataset,
            max_results: filter.max_return,
            scene_filter: SceneFilter {
                spatial_filter: spatial,
                acquisition_filter: temporal,
            },
            starting_number: 1,
        })?;
        let scenes: SceneSearchData = self.call(token, SCENE_SEARCH, body).await?;
        if scenes.records_returned == 0 || scenes.results.is_empty() {
            self.reporter.info(" no records found");
            return Ok(());
        }

        self.reporter.info("checking scenes...");
        let mut entity_ids = Vec::new();
        for scene in &scenes.results {
            self.reporter.debug(&format!(" {}", scene.display_id));
            if scene.cloud_cover > filter.cloud_cover {
                self.reporter.info(&format!(
                    "  removing {} for cloud cover ({}|{})",
                    scene.display_id, scene.cloud_cover, filter.cloud_cover
                ));
                continue;
            }
            entity_ids.push(scene.entity_id.clone());
        }
        if entity_ids.is_empty() {
            self.reporter.info("no scenes to download");
            return Ok(());
        }

        let body = serde_json::to_value(DownloadOptionsRequest {
            dataset_name: &dataset.dataset_alias,
            entity_ids,
        })?;
        let options: Vec<DownloadOption> = self.call(token, DOWNLOAD_OPTIONS, body).await?;

        let downloads: Vec<DownloadDescriptor> = options
            .into_iter()
            .filter(|option| option.available)
            .map(|option| DownloadDescriptor {
                entity_id: option.entity_id,
                product_id: option.id,
            })
            .collect();
        if downloads.is_empty() {
            self.reporter.info("no files to download");
            return Ok(());
        }

        let requested = downloads.len();
        let label = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let body = serde_json::to_value(DownloadRequest { downloads, label })?;
        let request: DownloadRequestData = self.call(token, DOWNLOAD_REQUEST, body).await?;

        for download in request.available_downloads {
            outcome.urls.push(DownloadUrl::new(download.url));
        }

        let preparing = request.preparing_downloads.map_or(0, |p| p.len());
        if preparing > 0 {
            return Err(FinderError::Unsupported(format!(
                "{} of {} download(s) in {} are still being prepared",
                preparing, requested, dataset.dataset_alias
            )));
        }
        Ok(())
    }

    async fn call<D: DeserializeOwned + Default>(
        &self,
        token: &str,
        endpoint: &str,
        body: Value,
    ) -> FinderResult<D> {
        let data = self
            .transport
            .post(endpoint, body, Some(token))
            .await?
            .into_result(endpoint)?;

        if is_empty_payload(&data) {
            return Ok(D::default());
        }
        serde_json::from_value(data).map_err(|e| FinderError::Query {
            endpoint: endpoint.to_string(),
            code: "DECODE".to_string(),
            message: e.to_string(),
        })
    }
}

impl<T: Transport> std::fmt::Display for RemoteCatalogClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session {
            Some(_) => write!(f, "EarthExplorer Landsat (logged in at {})", self.config.endpoint),
            None => write!(f, "EarthExplorer (not logged in)"),
        }
    }
}

fn is_empty_payload(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}
