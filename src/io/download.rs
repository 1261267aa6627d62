//! Turns download URLs into extracted band files under the catalog root.
//!
//! Each URL becomes one task in a bounded pool. The batch call owns its
//! tasks and returns only after every one of them has finished.

use crate::config::{retry_delay, DownloadConfig};
use crate::io::archive::{ArchiveExtractor, ExtractionOutcome};
use crate::report::StatusReporter;
use crate::types::{DownloadUrl, FinderError, FinderResult};
use reqwest::header::CONTENT_DISPOSITION;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Write buffer size for streamed bodies
pub const CHUNK_SIZE: usize = 8192;

const PARTIAL_SUFFIX: &str = ".part";

/// Cooperative cancellation shared by every task of a downloader
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns on cancellation
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What `download` did for one URL
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Target directory already populated; no transfer
    AlreadyPresent { dir: PathBuf },
    /// Target directory held a single leftover file that was re-extracted
    Repaired {
        archive: PathBuf,
        extraction: ExtractionOutcome,
    },
    Fetched {
        file: PathBuf,
        extraction: ExtractionOutcome,
    },
}

impl DownloadOutcome {
    pub fn transferred(&self) -> bool {
        matches!(self, DownloadOutcome::Fetched { .. })
    }
}

/// Per-URL result of a batch
#[derive(Debug)]
pub struct DownloadReport {
    pub url: DownloadUrl,
    pub result: FinderResult<DownloadOutcome>,
}

/// Directory an asset belongs in: `root/<tile>/<date>`.
///
/// Pure function of the URL; nothing is created on disk.
pub fn target_directory(root: &Path, url: &DownloadUrl) -> FinderResult<PathBuf> {
    let product = url.product_id()?;
    Ok(root.join(product.tile()).join(product.acquisition_date()))
}

/// Pull the file name out of a `Content-Disposition` header value
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let start = value.find("filename=")? + "filename=".len();
    let rest = value[start..].trim_start();
    let name = match rest.strip_prefix('"') {
        Some(quoted) => &quoted[..quoted.find('"')?],
        None => rest.split(';').next().unwrap_or(rest).trim(),
    };

    // Never let the server choose a path outside the target directory
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

struct DownloadContext {
    root: PathBuf,
    client: reqwest::Client,
    extractor: ArchiveExtractor,
    max_retries: u32,
    reporter: StatusReporter,
}

/// Concurrent asset downloader rooted at the catalog directory
pub struct Downloader {
    ctx: Arc<DownloadContext>,
    max_concurrent: usize,
    task_timeout: Duration,
    cancel: CancelToken,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> FinderResult<Self> {
        std::fs::create_dir_all(&config.working_folder)?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent("methane-finder/0.2.0");
        if !config.use_env_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        Ok(Self {
            ctx: Arc::new(DownloadContext {
                root: config.working_folder.clone(),
                client,
                extractor: ArchiveExtractor::new(config.delete_archive),
                max_retries: config.max_retries,
                reporter: StatusReporter::new(),
            }),
            max_concurrent: config.max_concurrent.max(1),
            task_timeout: config.task_timeout(),
            cancel: CancelToken::new(),
        })
    }

    /// Replace the reporter used by the downloader and its extractor
    pub fn with_reporter(self, reporter: StatusReporter) -> Self {
        let ctx = DownloadContext {
            root: self.ctx.root.clone(),
            client: self.ctx.client.clone(),
            extractor: self.ctx.extractor.clone().with_reporter(reporter.clone()),
            max_retries: self.ctx.max_retries,
            reporter,
        };
        Self {
            ctx: Arc::new(ctx),
            ..self
        }
    }

    pub fn root(&self) -> &Path {
        &self.ctx.root
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Target directory for `url`, created if missing
    pub fn resolve_target_directory(&self, url: &DownloadUrl) -> FinderResult<PathBuf> {
        self.ctx.resolve_target_directory(url)
    }

    /// Fetch and extract one asset, skipping it when already on disk
    pub async fn download(&self, url: &DownloadUrl) -> FinderResult<DownloadOutcome> {
        self.ctx.download(url).await
    }

    /// Download every URL in a bounded pool and wait for all of them.
    ///
    /// Reports come back in input order. Tasks that exceed the per-task
    /// timeout report `Timeout`; tasks still pending or running when the
    /// cancel token fires report `Cancelled`.
    pub async fn download_all(&self, urls: &[DownloadUrl]) -> Vec<DownloadReport> {
        if urls.is_empty() {
            return Vec::new();
        }
        self.ctx.reporter.info(&format!(
            "downloading {} asset(s), {} at a time",
            urls.len(),
            self.max_concurrent
        ));

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut workers = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let timeout = self.task_timeout;

            workers.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(FinderError::Cancelled(url.to_string())),
                    result = run_worker(ctx, semaphore, &url, timeout) => result,
                };
                (index, DownloadReport { url, result })
            });
        }

        let mut slots: Vec<Option<DownloadReport>> = urls.iter().map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => log::error!("Download worker failed: {}", e),
            }
        }

        let reports: Vec<DownloadReport> = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| DownloadReport {
                    url: url.clone(),
                    result: Err(FinderError::Processing(format!(
                        "download worker for {} did not complete",
                        url
                    ))),
                })
            })
            .collect();

        let failed = reports.iter().filter(|r| r.result.is_err()).count();
        self.ctx.reporter.info(&format!(
            "downloads finished: {} ok, {} failed",
            reports.len() - failed,
            failed
        ));
        reports
    }
}

async fn run_worker(
    ctx: Arc<DownloadContext>,
    semaphore: Arc<Semaphore>,
    url: &DownloadUrl,
    timeout: Duration,
) -> FinderResult<DownloadOutcome> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| FinderError::Processing(format!("download pool closed: {}", e)))?;

    tokio::time::timeout(timeout, ctx.download(url))
        .await
        .map_err(|_| FinderError::Timeout(format!("{} after {:?}", url, timeout)))?
}

impl DownloadContext {
    fn resolve_target_directory(&self, url: &DownloadUrl) -> FinderResult<PathBuf> {
        let dir = target_directory(&self.root, url).map_err(|e| {
            self.reporter.warn(&format!("invalid url {}", url));
            e
        })?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn download(&self, url: &DownloadUrl) -> FinderResult<DownloadOutcome> {
        let dir = self.resolve_target_directory(url)?;

        let existing = list_files(&dir).await?;
        if !existing.is_empty() {
            self.reporter
                .info(&format!("output folder is not empty: {}", dir.display()));
            // A lone file is most likely an archive whose extraction never ran
            if let [archive] = existing.as_slice() {
                let extraction = self.extract(archive.clone()).await?;
                if !matches!(extraction, ExtractionOutcome::NotAnArchive) {
                    return Ok(DownloadOutcome::Repaired {
                        archive: archive.clone(),
                        extraction,
                    });
                }
            }
            return Ok(DownloadOutcome::AlreadyPresent { dir });
        }

        let file = self.transfer(url, &dir).await?;
        let extraction = self.extract(file.clone()).await?;
        Ok(DownloadOutcome::Fetched { file, extraction })
    }

    async fn extract(&self, archive: PathBuf) -> FinderResult<ExtractionOutcome> {
        let extractor = self.extractor.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&archive))
            .await
            .map_err(|e| FinderError::Processing(format!("extraction task failed: {}", e)))
    }

    async fn transfer(&self, url: &DownloadUrl, dir: &Path) -> FinderResult<PathBuf> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                self.reporter.warn(&format!(
                    "retrying {} in {:?} (attempt {})",
                    url,
                    delay,
                    attempt + 1
                ));
                tokio::time::sleep(delay).await;
            }

            match self.transfer_once(url, dir).await {
                Ok(path) => return Ok(path),
                Err(e) if is_transient(&e) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FinderError::Processing(format!("{} failed after all retries", url))
        }))
    }

    async fn transfer_once(&self, url: &DownloadUrl, dir: &Path) -> FinderResult<PathBuf> {
        let product = url.product_id()?;
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await?
            .error_for_status()?;

        let name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("{}.tar", product));

        let target = dir.join(&name);
        let partial = dir.join(format!("{}{}", name, PARTIAL_SUFFIX));
        self.reporter.info(&format!("downloading {}", name));

        match stream_to_file(response, &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &target).await?;
                self.reporter
                    .info(&format!("downloaded {} ({} bytes)", target.display(), bytes));
                Ok(target)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> FinderResult<u64> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
    let mut total = 0u64;

    while let Some(chunk) = response.chunk().await? {
        writer.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Regular files in `dir`, ignoring leftovers of interrupted transfers
async fn list_files(dir: &Path) -> FinderResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let partial = path
            .to_str()
            .map(|p| p.ends_with(PARTIAL_SUFFIX))
            .unwrap_or(false);
        if entry.file_type().await?.is_file() && !partial {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_transient(error: &FinderError) -> bool {
    match error {
        FinderError::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.is_body()
                || e.status().map_or(false, |s| s.is_server_error())
        }
        _ => false,
    }
}
