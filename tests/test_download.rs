use methane_finder::io::{DownloadOutcome, ExtractionOutcome};
use methane_finder::{DownloadConfig, DownloadUrl, Downloader, FinderError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SCENE: &str = "LC08_L2SP_163033_20181104_20200830_02_T1";
const OTHER_SCENE: &str = "LC08_L2SP_163034_20181120_20200830_02_T1";
const MISSING_SCENE: &str = "LC08_L2SP_163035_20181127_20200830_02_T1";

fn scene_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in [
        (format!("{}_SR_B4.TIF", SCENE), b"band four".as_slice()),
        (format!("{}_SR_B6.TIF", SCENE), b"band six".as_slice()),
        (format!("{}_MTL.txt", SCENE), b"metadata".as_slice()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Minimal HTTP/1.1 server.
///
/// `/ok` serves the scene archive, `/missing` answers 404, `/flaky` fails
/// with 503 on its first hit and `/stall` never answers.
struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let flaky = Arc::new(AtomicUsize::new(0));
        let body = Arc::new(scene_tar());

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                let flaky = Arc::clone(&flaky);
                let body = Arc::clone(&body);
                tokio::spawn(handle(socket, counter, flaky, body));
            }
        });

        Self { addr, hits }
    }

    fn url(&self, route: &str, product: &str) -> DownloadUrl {
        DownloadUrl::new(format!(
            "http://{}/{}?id=5e83d0b92ff6b5e8&product_id={}",
            self.addr, route, product
        ))
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn handle(
    mut socket: TcpStream,
    hits: Arc<AtomicUsize>,
    flaky: Arc<AtomicUsize>,
    body: Arc<Vec<u8>>,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&request);
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    hits.fetch_add(1, Ordering::SeqCst);

    if path.starts_with("/stall") {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }

    let status = if path.starts_with("/missing") {
        Some("404 Not Found")
    } else if path.starts_with("/flaky") && flaky.fetch_add(1, Ordering::SeqCst) == 0 {
        Some("503 Service Unavailable")
    } else {
        None
    };

    let response = match status {
        Some(status) => format!(
            "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        )
        .into_bytes(),
        None => {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-tar\r\n\
                 Content-Disposition: attachment; filename=\"{}.tar\"\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                SCENE,
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(&body);
            response
        }
    };
    let _ = socket.write_all(&response).await;
    let _ = socket.shutdown().await;
}

fn config(root: &Path) -> DownloadConfig {
    DownloadConfig {
        working_folder: root.join("landsat"),
        max_concurrent: 2,
        task_timeout_secs: 30,
        max_retries: 0,
        delete_archive: true,
        use_env_proxy: false,
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_fetch_then_skip_existing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let downloader = Downloader::new(&config(tmp.path())).unwrap();
    let url = server.url("ok", SCENE);

    let outcome = downloader.download(&url).await.unwrap();
    assert!(outcome.transferred());
    match &outcome {
        DownloadOutcome::Fetched { file, extraction } => {
            assert_eq!(file.file_name().unwrap().to_string_lossy(), format!("{}.tar", SCENE));
            match extraction {
                ExtractionOutcome::Extracted { written, .. } => assert_eq!(written.len(), 2),
                other => panic!("expected extraction, got {:?}", other),
            }
        }
        other => panic!("expected fetch, got {:?}", other),
    }

    let dir = downloader.root().join("163033").join("20181104");
    assert_eq!(
        file_names(&dir),
        vec![format!("{}_SR_B4.TIF", SCENE), format!("{}_SR_B6.TIF", SCENE)]
    );

    // Second pass finds the populated directory and never hits the network
    let again = downloader.download(&url).await.unwrap();
    assert!(matches!(again, DownloadOutcome::AlreadyPresent { .. }));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_lone_archive_is_repaired_without_transfer() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let downloader = Downloader::new(&config(tmp.path())).unwrap();
    let url = server.url("ok", SCENE);

    let dir = downloader.resolve_target_directory(&url).unwrap();
    let archive = dir.join(format!("{}.tar", SCENE));
    std::fs::write(&archive, scene_tar()).unwrap();

    match downloader.download(&url).await.unwrap() {
        DownloadOutcome::Repaired { archive: repaired, extraction } => {
            assert_eq!(repaired, archive);
            assert!(matches!(extraction, ExtractionOutcome::Extracted { .. }));
        }
        other => panic!("expected repair, got {:?}", other),
    }
    assert!(!archive.exists());
    assert!(dir.join(format!("{}_SR_B6.TIF", SCENE)).exists());
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_url_without_product_id_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let downloader = Downloader::new(&config(tmp.path())).unwrap();

    let result = downloader
        .download(&DownloadUrl::new("http://127.0.0.1:9/file?id=3"))
        .await;
    assert!(matches!(result, Err(FinderError::InvalidUrl(_))));
    assert!(file_names(downloader.root()).is_empty());
}

#[tokio::test]
async fn test_transient_status_is_retried() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.max_retries = 1;
    let downloader = Downloader::new(&config).unwrap();

    let outcome = downloader.download(&server.url("flaky", SCENE)).await.unwrap();
    assert!(outcome.transferred());
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_batch_reports_follow_input_order() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let downloader = Downloader::new(&config(tmp.path())).unwrap();

    let urls = vec![
        server.url("ok", SCENE),
        DownloadUrl::new("http://127.0.0.1:9/file?id=3"),
        server.url("missing", MISSING_SCENE),
        server.url("ok", OTHER_SCENE),
    ];
    let reports = downloader.download_all(&urls).await;

    assert_eq!(reports.len(), urls.len());
    for (report, url) in reports.iter().zip(&urls) {
        assert_eq!(&report.url, url);
    }
    assert!(reports[0].result.is_ok());
    assert!(matches!(reports[1].result, Err(FinderError::InvalidUrl(_))));
    assert!(matches!(reports[2].result, Err(FinderError::Http(_))));
    assert!(reports[3].result.is_ok());

    // The 404 leaves neither a body nor a partial file behind
    let failed_dir = downloader.root().join("163035").join("20181127");
    assert!(file_names(&failed_dir)
        .iter()
        .all(|name| !name.ends_with(".part")));
}

#[tokio::test]
async fn test_stalled_task_times_out() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.task_timeout_secs = 1;
    let downloader = Downloader::new(&config).unwrap();

    let urls = vec![server.url("stall", SCENE), server.url("ok", OTHER_SCENE)];
    let reports = downloader.download_all(&urls).await;

    assert!(matches!(reports[0].result, Err(FinderError::Timeout(_))));
    assert!(reports[1].result.is_ok());
}

#[tokio::test]
async fn test_cancel_stops_pending_and_running_tasks() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.max_concurrent = 1;
    let downloader = Downloader::new(&config).unwrap();

    let token = downloader.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let urls = vec![server.url("stall", SCENE), server.url("stall", OTHER_SCENE)];
    let reports = downloader.download_all(&urls).await;

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(
            matches!(report.result, Err(FinderError::Cancelled(_))),
            "got {:?}",
            report.result
        );
    }
    assert!(downloader.cancel_token().is_cancelled());
}
