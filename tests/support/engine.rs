//! Engine harness: a temp base directory, a file-backed store and a scripted
//! transport standing in for the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use debrid_core::resolver::ResolveError;
use debrid_core::transfer::{ByteStream, Transport, TransportResponse, TransferError};
use debrid_core::{
    ArchiveProcessor, Database, Download, DownloadService, DownloadStore, EngineConfig,
    FileClassifier, LinkResolver, NewDownload, PathValidator, ResolvedLink, Scheduler,
    SchedulerHandle, SchedulerSettings, TransferExecutor, TransferSettings,
};
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CDN: &str = "https://cdn.example/dl";

type StreamCounts = Arc<Mutex<HashMap<String, (usize, usize)>>>;

/// Serves registered files in small chunks, honoring byte ranges.
#[derive(Debug)]
pub struct ScriptedTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    chunk: usize,
    delay: Duration,
    opened: Mutex<Vec<(String, u64)>>,
    /// Per URL: bodies alive now and the most ever alive at once.
    streams: StreamCounts,
}

/// Counts one open body; dropped together with the stream.
struct LiveBody {
    url: String,
    streams: StreamCounts,
}

impl LiveBody {
    fn open(url: &str, streams: &StreamCounts) -> Self {
        let mut counts = streams.lock().unwrap();
        let entry = counts.entry(url.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        Self {
            url: url.to_string(),
            streams: Arc::clone(streams),
        }
    }
}

impl Drop for LiveBody {
    fn drop(&mut self) {
        if let Some(entry) = self.streams.lock().unwrap().get_mut(&self.url) {
            entry.0 -= 1;
        }
    }
}

impl ScriptedTransport {
    pub fn new(chunk: usize, delay: Duration) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            chunk,
            delay,
            opened: Mutex::new(Vec::new()),
            streams: Arc::default(),
        }
    }

    pub fn fast() -> Self {
        Self::new(64, Duration::ZERO)
    }

    /// Registers `data` under `{CDN}/{name}` and returns the URL.
    pub fn serve(&self, name: &str, data: &[u8]) -> String {
        let url = format!("{CDN}/{name}");
        self.files
            .lock()
            .unwrap()
            .insert(url.clone(), data.to_vec());
        url
    }

    /// Every `(url, offset)` opened so far, in order.
    pub fn opened(&self) -> Vec<(String, u64)> {
        self.opened.lock().unwrap().clone()
    }

    /// Most bodies of `url` that were ever being read at the same time.
    pub fn max_concurrent_streams(&self, url: &str) -> usize {
        self.streams.lock().unwrap().get(url).map_or(0, |(_, max)| *max)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str, offset: u64) -> Result<TransportResponse, TransferError> {
        self.opened.lock().unwrap().push((url.to_string(), offset));
        let Some(data) = self.files.lock().unwrap().get(url).cloned() else {
            return Err(TransferError::http_status(url, 404));
        };

        let start = usize::try_from(offset).unwrap().min(data.len());
        let partial = offset > 0;
        let remaining = data[start..].to_vec();
        let content_length = Some(remaining.len() as u64);
        let delay = self.delay;
        let chunks: Vec<Bytes> = remaining
            .chunks(self.chunk)
            .map(Bytes::copy_from_slice)
            .collect();
        let live = LiveBody::open(url, &self.streams);
        let body: ByteStream = Box::pin(futures_util::stream::iter(chunks).then(move |chunk| {
            let _live = &live;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<Bytes, TransferError>(chunk)
            }
        }));

        Ok(TransportResponse {
            status: if partial { 206 } else { 200 },
            content_length,
            body,
        })
    }
}

/// Resolves `https://hoster.example/<name>` to `{CDN}/<name>`.
#[derive(Debug, Default)]
pub struct HosterResolver;

#[async_trait]
impl LinkResolver for HosterResolver {
    async fn resolve(&self, link: &str) -> Result<ResolvedLink, ResolveError> {
        let name = link
            .strip_prefix("https://hoster.example/")
            .ok_or_else(|| ResolveError::Api {
                code: "LINK_HOST_NOT_SUPPORTED".to_string(),
                message: link.to_string(),
            })?;
        Ok(ResolvedLink {
            direct_url: format!("{CDN}/{name}"),
            filename: name.to_string(),
            size: 0,
        })
    }

    async fn validate_credentials(&self) -> Result<(), ResolveError> {
        Ok(())
    }
}

pub struct Engine {
    pub dir: TempDir,
    pub store: DownloadStore,
    pub paths: PathValidator,
    pub transport: Arc<ScriptedTransport>,
}

impl Engine {
    pub async fn new(transport: ScriptedTransport) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::new(&dir.path().join("downloads")).unwrap();
        let db = Database::new(&dir.path().join("engine.db")).await.unwrap();
        Self {
            dir,
            store: DownloadStore::new(db),
            paths,
            transport: Arc::new(transport),
        }
    }

    pub fn settings(max_concurrent: usize) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent,
            poll_interval: Duration::from_millis(25),
            retention: Duration::from_secs(30 * 86_400),
            retention_interval: Duration::from_secs(3600),
        }
    }

    pub fn scheduler(&self, max_concurrent: usize) -> Scheduler {
        let repo = Arc::new(self.store.clone());
        let executor = TransferExecutor::new(
            self.transport.clone(),
            repo.clone(),
            self.paths.clone(),
            TransferSettings {
                progress_interval: Duration::from_millis(20),
                ..TransferSettings::default()
            },
        );
        let archive = ArchiveProcessor::new(
            repo,
            self.paths.clone(),
            FileClassifier::from_config(&EngineConfig::default()),
        );
        Scheduler::new(
            self.store.clone(),
            executor,
            archive,
            Self::settings(max_concurrent),
        )
        .unwrap()
    }

    pub fn service(&self, scheduler: &Scheduler) -> DownloadService {
        DownloadService::new(self.store.clone(), self.paths.clone(), scheduler.handle())
            .with_resolver(Arc::new(HosterResolver))
    }

    /// A service the way a separate CLI process builds it: same database,
    /// no access to the worker's running transfers.
    pub async fn remote_service(&self) -> DownloadService {
        let db = Database::new(&self.dir.path().join("engine.db")).await.unwrap();
        DownloadService::new(
            DownloadStore::new(db),
            self.paths.clone(),
            SchedulerHandle::default(),
        )
    }

    /// Inserts a pending download for a file already registered on the transport.
    pub async fn queue(&self, name: &str) -> i64 {
        self.store
            .create_download(&NewDownload {
                original_url: format!("https://hoster.example/{name}"),
                unrestricted_url: format!("{CDN}/{name}"),
                filename: name.to_string(),
                directory: self.paths.base().display().to_string(),
                file_size: 0,
                is_archive: false,
            })
            .await
            .unwrap()
    }

    pub async fn download(&self, id: i64) -> Download {
        self.store.get_download(id).await.unwrap().unwrap()
    }

    /// Polls `id` until `check` holds, panicking after five seconds.
    pub async fn wait_for(&self, id: i64, check: impl Fn(&Download) -> bool) -> Download {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let download = self.download(id).await;
            if check(&download) {
                return download;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on {download}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A scheduler running on its own task.
pub struct Running {
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Running {
    pub fn start(scheduler: Scheduler) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            scheduler.run(token).await.unwrap();
        });
        Self { shutdown, task }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap();
    }
}
