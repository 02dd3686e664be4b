// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport built on reqwest.
//!
//! Each transfer runs as its own tokio task and streams the body into
//! `<destination>.part`. Only a complete body is renamed into place, so a
//! finished file is never observed half-written. Pause and cancel reach the
//! transfer through a `watch` channel keyed by its handle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use url::Url;

use super::error::{DownloadError, Result};
use super::transport::{EventSender, Transport, TransportEvent, TransportHandle, TransportRequest};
use crate::config::DownloaderConfig;
use crate::locks::resilient_lock;

/// Default user agent sent with every request.
pub const USER_AGENT: &str = concat!("nativedl/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Cancelled,
}

/// How a transfer that did not fail came to an end.
enum Finish {
    Completed { file_url: String },
    Cancelled,
}

type Controls = Arc<Mutex<HashMap<TransportHandle, watch::Sender<Control>>>>;

/// Downloads over HTTP(S) with reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    runtime: Handle,
    read_timeout: Duration,
    next_handle: AtomicU64,
    controls: Controls,
}

impl HttpTransport {
    /// Build a transport from the user configuration.
    ///
    /// Must be called from within a tokio runtime; transfers are spawned onto it.
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloadError::TransportFailure(format!("no tokio runtime available: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.as_deref().unwrap_or(USER_AGENT))
            .build()
            .map_err(|e| DownloadError::TransportFailure(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            runtime,
            read_timeout: config.read_timeout(),
            next_handle: AtomicU64::new(1),
            controls: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of transfers still running.
    pub fn in_flight(&self) -> usize {
        resilient_lock(&self.controls).len()
    }

    fn signal(&self, handle: TransportHandle, control: Control) {
        let controls = resilient_lock(&self.controls);
        match controls.get(&handle) {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    if *current == Control::Cancelled || *current == control {
                        return false;
                    }
                    *current = control;
                    true
                });
            }
            None => tracing::debug!(%handle, ?control, "no running transfer for handle"),
        }
    }
}

impl Transport for HttpTransport {
    fn begin(&self, request: TransportRequest, events: EventSender) -> Result<TransportHandle> {
        Url::parse(&request.url)
            .map_err(|e| DownloadError::TransportFailure(format!("invalid url '{}': {}", request.url, e)))?;

        let handle = TransportHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = watch::channel(Control::Running);
        resilient_lock(&self.controls).insert(handle, tx);

        let client = self.client.clone();
        let controls = Arc::clone(&self.controls);
        let read_timeout = self.read_timeout;
        self.runtime.spawn(async move {
            run_transfer(client, request, handle, rx, events, read_timeout).await;
            resilient_lock(&controls).remove(&handle);
        });

        Ok(handle)
    }

    fn suspend(&self, handle: TransportHandle) {
        self.signal(handle, Control::Paused);
    }

    fn resume(&self, handle: TransportHandle) {
        self.signal(handle, Control::Running);
    }

    fn cancel(&self, handle: TransportHandle) {
        self.signal(handle, Control::Cancelled);
    }
}

async fn run_transfer(
    client: reqwest::Client,
    request: TransportRequest,
    handle: TransportHandle,
    mut control: watch::Receiver<Control>,
    events: EventSender,
    read_timeout: Duration,
) {
    tracing::debug!(task = %request.task_id, %handle, url = %request.url, "transfer started");
    let partial = request.partial_path();

    match transfer(&client, &request, handle, &mut control, &events, read_timeout).await {
        Ok(Finish::Completed { file_url }) => {
            events.send(TransportEvent::complete(&request.task_id, handle, file_url));
        }
        Ok(Finish::Cancelled) => {
            tracing::debug!(task = %request.task_id, %handle, "transfer cancelled");
            remove_partial(&partial).await;
        }
        Err(message) => {
            remove_partial(&partial).await;
            events.send(TransportEvent::failed(&request.task_id, handle, message));
        }
    }
}

async fn transfer(
    client: &reqwest::Client,
    request: &TransportRequest,
    handle: TransportHandle,
    control: &mut watch::Receiver<Control>,
    events: &EventSender,
    read_timeout: Duration,
) -> std::result::Result<Finish, String> {
    let partial = request.partial_path();
    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }

    let mut builder = client.get(&request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = tokio::select! {
        response = builder.send() => response.map_err(|e| e.to_string())?,
        _ = cancelled(control) => return Ok(Finish::Cancelled),
    };
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {}", status));
    }

    let total = response
        .content_length()
        .filter(|len| *len > 0)
        .unwrap_or(request.declared_size);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| format!("cannot create {}: {}", partial.display(), e))?;
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;
    let mut last_percent = 0u64;

    loop {
        let state = *control.borrow_and_update();
        match state {
            Control::Cancelled => return Ok(Finish::Cancelled),
            Control::Paused => {
                if !resumed(control).await {
                    return Ok(Finish::Cancelled);
                }
                continue;
            }
            Control::Running => {}
        }

        let next = tokio::select! {
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
            changed = control.changed() => {
                if changed.is_err() {
                    return Ok(Finish::Cancelled);
                }
                continue;
            }
        };

        let chunk = match next {
            Err(_) => return Err(format!("read timed out: no data received for {:?}", read_timeout)),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(Some(Ok(chunk))) => chunk,
        };

        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write to {} failed: {}", partial.display(), e))?;
        downloaded += chunk.len() as u64;

        // Whole percents only; finer ticks are noise for the UI.
        if total > 0 {
            let percent = (downloaded.saturating_mul(100) / total).min(100);
            if percent > last_percent {
                last_percent = percent;
                events.send(TransportEvent::progress(&request.task_id, handle, percent as f64 / 100.0));
            }
        }
    }

    file.flush().await.map_err(|e| e.to_string())?;
    file.sync_all().await.map_err(|e| e.to_string())?;
    drop(file);

    tokio::fs::rename(&partial, &request.destination)
        .await
        .map_err(|e| format!("cannot move download into place: {}", e))?;

    tracing::debug!(task = %request.task_id, bytes = downloaded, "transfer finished");
    Ok(Finish::Completed { file_url: file_url(&request.destination) })
}

/// Resolves once the transfer is cancelled or its controller is gone.
async fn cancelled(control: &mut watch::Receiver<Control>) {
    let _ = control.wait_for(|c| *c == Control::Cancelled).await;
}

/// Waits out a pause. False if the transfer was cancelled meanwhile.
async fn resumed(control: &mut watch::Receiver<Control>) -> bool {
    match control.wait_for(|c| *c != Control::Paused).await {
        Ok(state) => *state == Control::Running,
        Err(_) => false,
    }
}

fn file_url(path: &Path) -> String {
    Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove partial download: {}", e),
    }
}
