#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use track_downloader::api::{self, ApiError, Billing, Catalog, Invoice, InvoiceStatus, TrackMetadata};
use track_downloader::application::TransferOptions;
use track_downloader::{
    CacheStore, CoordinatorOptions, DownloadCoordinator, ProgressEvent, ProgressListener,
};

#[derive(Default)]
pub struct FakeCatalog {
    tracks: Mutex<HashMap<String, TrackMetadata>>,
    pub lookups: AtomicUsize,
    /// Makes the next lookups panic inside the transfer task.
    pub panic_on_lookup: AtomicBool,
}

impl FakeCatalog {
    pub fn add(&self, id: &str, url: &str, title: &str, artist: &str) {
        self.tracks.lock().unwrap().insert(
            id.to_string(),
            TrackMetadata {
                url: url.to_string(),
                title: title.to_string(),
                artist: artist.to_string(),
            },
        );
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn get_resource_metadata(&self, resource_id: &str) -> api::Result<TrackMetadata> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_lookup.load(Ordering::SeqCst) {
            panic!("catalog lookup panicked for {}", resource_id);
        }
        self.tracks
            .lock()
            .unwrap()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(resource_id.to_string()))
    }
}

#[derive(Default)]
pub struct FakeBilling {
    invoices: Mutex<HashMap<(String, String), Invoice>>,
    pub created: AtomicUsize,
}

impl FakeBilling {
    pub fn set(&self, user: &str, resource: &str, id: &str, status: InvoiceStatus) {
        self.invoices.lock().unwrap().insert(
            (user.to_string(), resource.to_string()),
            Invoice {
                id: id.to_string(),
                status,
            },
        );
    }

    /// Marks the current invoice for (`user`, `resource`) as paid.
    pub fn pay(&self, user: &str, resource: &str) {
        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .get_mut(&(user.to_string(), resource.to_string()))
            .expect("invoice exists");
        invoice.status = InvoiceStatus::Paid;
    }
}

#[async_trait]
impl Billing for FakeBilling {
    async fn get_invoice(&self, user: &str, resource: &str) -> api::Result<Option<Invoice>> {
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .get(&(user.to_string(), resource.to_string()))
            .cloned())
    }

    async fn create_invoice(&self, user: &str, resource: &str, _: &str) -> api::Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("INV-{}", n);
        self.set(user, resource, &id, InvoiceStatus::Pending);
        Ok(id)
    }
}

pub struct Harness {
    pub coordinator: DownloadCoordinator,
    pub catalog: Arc<FakeCatalog>,
    pub billing: Arc<FakeBilling>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(CoordinatorOptions::default())
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self::with_options(CoordinatorOptions {
            transfer: TransferOptions {
                idle_timeout,
                ..TransferOptions::default()
            },
            ..CoordinatorOptions::default()
        })
    }

    pub fn with_options(options: CoordinatorOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(FakeCatalog::default());
        let billing = Arc::new(FakeBilling::default());
        let cache = CacheStore::open(dir.path()).unwrap();
        let coordinator =
            DownloadCoordinator::new(catalog.clone(), billing.clone(), cache, Client::new(), options);
        Self {
            coordinator,
            catalog,
            billing,
            dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Files left in the partial directory.
    pub fn partial_files(&self) -> usize {
        std::fs::read_dir(self.root().join(".partial"))
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

pub fn channel_listener() -> (ProgressListener, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: ProgressListener = Arc::new(move |event: &ProgressEvent| {
        let _ = tx.send(event.clone());
    });
    (listener, rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn fractions(events: &[ProgressEvent]) -> Vec<f32> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress(f) => Some(*f),
            _ => None,
        })
        .collect()
}

/// HTTP server that sends the first `split` bytes of `body` right away and
/// holds the rest until [`GatedServer::release`] is called.
pub struct GatedServer {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    release: watch::Sender<bool>,
}

impl GatedServer {
    /// Responds with a `Content-Length` header.
    pub async fn start(body: Vec<u8>, split: usize) -> Self {
        Self::serve(body, split, false).await
    }

    /// Responds with chunked transfer encoding and no `Content-Length`.
    pub async fn start_chunked(body: Vec<u8>, split: usize) -> Self {
        Self::serve(body, split, true).await
    }

    async fn serve(body: Vec<u8>, split: usize, chunked: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (release, released) = watch::channel(false);
        let body = Arc::new(body);

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                let mut released = released.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }

                    let head = if chunked {
                        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: audio/mpeg\r\n\r\n"
                            .to_string()
                    } else {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: audio/mpeg\r\n\r\n",
                            body.len()
                        )
                    };
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.write_all(&frame(&body[..split], chunked)).await;
                    let _ = socket.flush().await;

                    if released.wait_for(|r| *r).await.is_err() {
                        return;
                    }
                    let _ = socket.write_all(&frame(&body[split..], chunked)).await;
                    if chunked {
                        let _ = socket.write_all(b"0\r\n\r\n").await;
                    }
                    let _ = socket.flush().await;
                });
            }
        });

        Self {
            url: format!("http://{}", addr),
            connections,
            release,
        }
    }

    pub fn release(&self) {
        let _ = self.release.send(true);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Wraps `data` in one chunk when chunked, leaving empty input empty so it
/// never reads as the terminating chunk.
fn frame(data: &[u8], chunked: bool) -> Vec<u8> {
    if !chunked {
        return data.to_vec();
    }
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}
