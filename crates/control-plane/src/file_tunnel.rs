//! Long-poll file tunnel.
//!
//! Some agent deployments cannot hold a push tunnel open, so file operations
//! can also flow pull-style: the plane queues work per node, agents long-poll
//! for it and post resolutions back. Inbound upload payloads are staged here
//! until the agent fetches them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use common::wire::{FileOperation, FileRequest};
use metrics::{counter, gauge};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::FileTunnelConfig;
use crate::error::FileTunnelError;

type Resolution = Result<serde_json::Value, FileTunnelError>;

struct PendingRequest {
    node_id: Uuid,
    response_tx: oneshot::Sender<Resolution>,
    created_at: Instant,
}

struct Poller {
    id: u64,
    tx: oneshot::Sender<Vec<FileRequest>>,
}

struct StagedUpload {
    node_id: Uuid,
    data: Bytes,
    created_at: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingRequest>,
    queues: HashMap<Uuid, VecDeque<FileRequest>>,
    pollers: HashMap<Uuid, VecDeque<Poller>>,
    uploads: HashMap<String, StagedUpload>,
    next_poller_id: u64,
    stopped: bool,
}

impl State {
    /// `(delivered, queued)` outstanding requests for a node. Every request
    /// keeps a pending entry until resolution, so delivered is the pending
    /// count minus what still sits in the queue.
    fn load_for_node(&self, node_id: Uuid) -> (usize, usize) {
        let pending = self
            .pending
            .values()
            .filter(|entry| entry.node_id == node_id)
            .count();
        let queued = self.queues.get(&node_id).map(VecDeque::len).unwrap_or(0);
        (pending.saturating_sub(queued), queued)
    }
}

/// Per-node work queue with long-poll delivery and correlated resolutions.
#[derive(Clone)]
pub struct FileTunnel {
    inner: Arc<Mutex<State>>,
    cfg: FileTunnelConfig,
}

impl FileTunnel {
    pub fn new(cfg: FileTunnelConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::default())),
            cfg,
        }
    }

    pub fn config(&self) -> &FileTunnelConfig {
        &self.cfg
    }

    /// Queues a file operation for a node and waits for its resolution.
    ///
    /// Admission control happens before any side effect: a node at capacity
    /// or an oversized upload leaves no trace. On timeout the pending entry
    /// is removed before the error is returned, so a late resolution after
    /// this call cannot deliver anywhere.
    pub async fn queue_request(
        &self,
        node_id: Uuid,
        operation: FileOperation,
        server_uuid: Uuid,
        path: Option<String>,
        data: Option<serde_json::Value>,
        upload: Option<Bytes>,
    ) -> Result<serde_json::Value, FileTunnelError> {
        let request_id = format!("f-{}", Uuid::new_v4());
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut state = self.inner.lock().await;
            if state.stopped {
                return Err(FileTunnelError::Stopped);
            }

            let (pending, queued) = state.load_for_node(node_id);
            if pending + queued >= self.cfg.max_pending_per_node {
                counter!("aero_cp_file_tunnel_rejected_total", "reason" => "capacity")
                    .increment(1);
                return Err(FileTunnelError::Capacity {
                    pending,
                    queued,
                    limit: self.cfg.max_pending_per_node,
                });
            }

            if let Some(ref payload) = upload {
                if payload.len() as u64 > self.cfg.max_upload_bytes() {
                    counter!("aero_cp_file_tunnel_rejected_total", "reason" => "too_large")
                        .increment(1);
                    return Err(FileTunnelError::UploadTooLarge {
                        limit_mb: self.cfg.max_upload_mb,
                    });
                }
            }

            let has_upload = upload.is_some();
            if let Some(payload) = upload {
                state.uploads.insert(
                    request_id.clone(),
                    StagedUpload {
                        node_id,
                        data: payload,
                        created_at: Instant::now(),
                    },
                );
            }

            state.pending.insert(
                request_id.clone(),
                PendingRequest {
                    node_id,
                    response_tx,
                    created_at: Instant::now(),
                },
            );

            let request = FileRequest {
                request_id: request_id.clone(),
                operation,
                server_uuid,
                path,
                data,
                has_upload,
            };

            // Hand straight to a parked poller when one is waiting; pollers
            // that gave up leave closed channels behind, skip those.
            let mut delivered = false;
            if let Some(pollers) = state.pollers.get_mut(&node_id) {
                while let Some(poller) = pollers.pop_front() {
                    if poller.tx.send(vec![request.clone()]).is_ok() {
                        delivered = true;
                        break;
                    }
                }
            }
            if !delivered {
                state.queues.entry(node_id).or_default().push_back(request);
            }

            gauge!("aero_cp_file_tunnel_pending").set(state.pending.len() as f64);
            counter!("aero_cp_file_tunnel_requests_total", "operation" => operation.as_str())
                .increment(1);
        }

        match tokio::time::timeout(self.cfg.request_timeout(), response_rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped without resolving, e.g. a GC sweep.
            Ok(Err(_closed)) => Err(FileTunnelError::Timeout),
            Err(_elapsed) => {
                self.remove_expired(node_id, &request_id).await;
                Err(FileTunnelError::Timeout)
            }
        }
    }

    /// Drops every trace of a timed-out request so a late resolution finds
    /// nothing to deliver to.
    async fn remove_expired(&self, node_id: Uuid, request_id: &str) {
        let mut state = self.inner.lock().await;
        state.pending.remove(request_id);
        state.uploads.remove(request_id);
        if let Some(queue) = state.queues.get_mut(&node_id) {
            queue.retain(|request| request.request_id != request_id);
            if queue.is_empty() {
                state.queues.remove(&node_id);
            }
        }
        counter!("aero_cp_file_tunnel_rejected_total", "reason" => "timeout").increment(1);
        gauge!("aero_cp_file_tunnel_pending").set(state.pending.len() as f64);
    }

    /// Agent long-poll: drains all queued work immediately, otherwise parks
    /// until work arrives or the poll window closes.
    pub async fn poll_requests(&self, node_id: Uuid) -> Vec<FileRequest> {
        let (poller_id, response_rx) = {
            let mut state = self.inner.lock().await;
            if state.stopped {
                return Vec::new();
            }

            if let Some(queue) = state.queues.remove(&node_id) {
                if !queue.is_empty() {
                    return queue.into();
                }
            }

            let poller_id = state.next_poller_id;
            state.next_poller_id += 1;
            let (tx, rx) = oneshot::channel();
            state
                .pollers
                .entry(node_id)
                .or_default()
                .push_back(Poller { id: poller_id, tx });
            (poller_id, rx)
        };

        match tokio::time::timeout(self.cfg.poll_timeout(), response_rx).await {
            Ok(Ok(requests)) => requests,
            Ok(Err(_closed)) => Vec::new(),
            Err(_elapsed) => {
                let mut state = self.inner.lock().await;
                if let Some(pollers) = state.pollers.get_mut(&node_id) {
                    pollers.retain(|poller| poller.id != poller_id);
                    if pollers.is_empty() {
                        state.pollers.remove(&node_id);
                    }
                }
                Vec::new()
            }
        }
    }

    /// Agent posts the outcome of a delivered request. Returns whether the
    /// resolution was accepted; a node resolving another node's request is
    /// rejected without touching the entry.
    pub async fn resolve_request(
        &self,
        node_id: Uuid,
        request_id: &str,
        payload: serde_json::Value,
    ) -> bool {
        let mut state = self.inner.lock().await;
        match state.pending.get(request_id) {
            Some(entry) if entry.node_id != node_id => {
                warn!(%node_id, %request_id, "resolution from wrong node rejected");
                return false;
            }
            Some(_) => {}
            None => {
                debug!(%node_id, %request_id, "resolution for unknown request");
                return false;
            }
        }

        let entry = match state.pending.remove(request_id) {
            Some(entry) => entry,
            None => return false,
        };
        state.uploads.remove(request_id);
        gauge!("aero_cp_file_tunnel_pending").set(state.pending.len() as f64);

        // The waiter may already have timed out and gone away; the request
        // still counts as resolved.
        let _ = entry.response_tx.send(Ok(payload));
        true
    }

    /// Staged upload bytes for a request, if they belong to the asking node.
    /// Non-destructive so the agent can retry the fetch.
    pub async fn get_upload_data(&self, node_id: Uuid, request_id: &str) -> Option<Bytes> {
        let state = self.inner.lock().await;
        let staged = state.uploads.get(request_id)?;
        if staged.node_id != node_id {
            warn!(%node_id, %request_id, "upload fetch from wrong node rejected");
            return None;
        }
        Some(staged.data.clone())
    }

    /// Whether any poller is currently parked for the node.
    pub async fn is_node_connected(&self, node_id: Uuid) -> bool {
        let mut state = self.inner.lock().await;
        let Some(pollers) = state.pollers.get_mut(&node_id) else {
            return false;
        };
        pollers.retain(|poller| !poller.tx.is_closed());
        !pollers.is_empty()
    }

    pub async fn get_pending_count(&self, node_id: Uuid) -> usize {
        let state = self.inner.lock().await;
        let (pending, queued) = state.load_for_node(node_id);
        pending + queued
    }

    /// Stops the tunnel: waiting callers get `Stopped`, parked pollers get
    /// an empty batch, staged state is discarded. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut state = self.inner.lock().await;
        if state.stopped {
            return;
        }
        state.stopped = true;

        for (_id, entry) in state.pending.drain() {
            let _ = entry.response_tx.send(Err(FileTunnelError::Stopped));
        }
        for (_node, mut pollers) in state.pollers.drain() {
            for poller in pollers.drain(..) {
                let _ = poller.tx.send(Vec::new());
            }
        }
        state.queues.clear();
        state.uploads.clear();
        gauge!("aero_cp_file_tunnel_pending").set(0.0);
    }

    /// Sweeps expired state: staged uploads past their TTL and pending
    /// requests past twice the request deadline whose waiters are gone.
    /// The doubled deadline keeps the sweep from racing a live waiter's own
    /// timeout path. Returns `(uploads_removed, pending_removed)`.
    pub async fn run_gc_sweep(&self, now: Instant) -> (usize, usize) {
        let mut state = self.inner.lock().await;
        if state.stopped {
            return (0, 0);
        }

        let upload_ttl = self.cfg.upload_ttl();
        let before_uploads = state.uploads.len();
        state
            .uploads
            .retain(|_, staged| now.duration_since(staged.created_at) < upload_ttl);
        let uploads_removed = before_uploads - state.uploads.len();

        let request_timeout = self.cfg.request_timeout() * 2;
        let before_pending = state.pending.len();
        state
            .pending
            .retain(|_, entry| now.duration_since(entry.created_at) < request_timeout);
        let pending_removed = before_pending - state.pending.len();

        // Queued requests whose pending entry is gone will never resolve.
        let live: Vec<String> = state.pending.keys().cloned().collect();
        state.queues.retain(|_, queue| {
            queue.retain(|request| live.contains(&request.request_id));
            !queue.is_empty()
        });

        if uploads_removed > 0 || pending_removed > 0 {
            gauge!("aero_cp_file_tunnel_pending").set(state.pending.len() as f64);
        }
        (uploads_removed, pending_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> FileTunnelConfig {
        FileTunnelConfig {
            max_pending_per_node: 4,
            max_upload_mb: 1,
            request_timeout_secs: 10,
            poll_timeout_secs: 5,
            upload_ttl_secs: 60,
            gc_interval_secs: 60,
        }
    }

    fn tunnel() -> FileTunnel {
        FileTunnel::new(config())
    }

    #[tokio::test]
    async fn queued_request_resolves_through_poll_cycle() {
        let ft = tunnel();
        let node = Uuid::new_v4();
        let server = Uuid::new_v4();

        let waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    server,
                    Some("/logs".to_string()),
                    None,
                    None,
                )
                .await
            }
        });

        // Let the request land in the queue.
        tokio::task::yield_now().await;
        let batch = ft.poll_requests(node).await;
        assert_eq!(batch.len(), 1);
        let request = &batch[0];
        assert_eq!(request.operation, FileOperation::ReadDirectory);
        assert_eq!(request.path.as_deref(), Some("/logs"));
        assert!(!request.has_upload);

        assert!(
            ft.resolve_request(node, &request.request_id, json!({"entries": ["a.log"]}))
                .await
        );

        let resolution = waiter.await.expect("join").expect("resolution");
        assert_eq!(resolution["entries"][0], "a.log");
        assert_eq!(ft.get_pending_count(node).await, 0);
    }

    #[tokio::test]
    async fn parked_poller_receives_request_inline() {
        let ft = tunnel();
        let node = Uuid::new_v4();

        let poller = tokio::spawn({
            let ft = ft.clone();
            async move { ft.poll_requests(node).await }
        });
        tokio::task::yield_now().await;

        let waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::DeleteBackup,
                    Uuid::new_v4(),
                    Some("old.tar.gz".to_string()),
                    None,
                    None,
                )
                .await
            }
        });

        let batch = poller.await.expect("join");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operation, FileOperation::DeleteBackup);

        assert!(
            ft.resolve_request(node, &batch[0].request_id, serde_json::Value::Null)
                .await
        );
        waiter.await.expect("join").expect("resolution");
    }

    #[tokio::test]
    async fn second_request_queues_once_the_poller_is_consumed() {
        let ft = tunnel();
        let node = Uuid::new_v4();

        let poller = tokio::spawn({
            let ft = ft.clone();
            async move { ft.poll_requests(node).await }
        });
        tokio::task::yield_now().await;

        let first = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    Uuid::new_v4(),
                    Some("/a".to_string()),
                    None,
                    None,
                )
                .await
            }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    Uuid::new_v4(),
                    Some("/b".to_string()),
                    None,
                    None,
                )
                .await
            }
        });
        tokio::task::yield_now().await;

        // The parked poller got exactly the first request.
        let batch = poller.await.expect("join");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path.as_deref(), Some("/a"));

        // The second sits in the queue and drains on the next poll.
        {
            let state = ft.inner.lock().await;
            assert_eq!(state.queues.get(&node).map(VecDeque::len), Some(1));
        }
        let batch2 = ft.poll_requests(node).await;
        assert_eq!(batch2.len(), 1);
        assert_eq!(batch2[0].path.as_deref(), Some("/b"));

        assert!(
            ft.resolve_request(node, &batch[0].request_id, json!({}))
                .await
        );
        assert!(
            ft.resolve_request(node, &batch2[0].request_id, json!({}))
                .await
        );
        first.await.expect("join").expect("first resolution");
        second.await.expect("join").expect("second resolution");
    }

    #[tokio::test]
    async fn capacity_is_enforced_before_side_effects() {
        let mut cfg = config();
        cfg.max_pending_per_node = 1;
        let ft = FileTunnel::new(cfg);
        let node = Uuid::new_v4();

        let _first = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    Uuid::new_v4(),
                    None,
                    None,
                    None,
                )
                .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(ft.get_pending_count(node).await, 1);

        let err = ft
            .queue_request(
                node,
                FileOperation::ReadDirectory,
                Uuid::new_v4(),
                None,
                None,
                Some(Bytes::from_static(b"payload")),
            )
            .await
            .expect_err("capacity");
        assert!(matches!(err, FileTunnelError::Capacity { .. }));

        // The rejected request staged nothing.
        let state = ft.inner.lock().await;
        assert!(state.uploads.is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let ft = tunnel();
        let node = Uuid::new_v4();
        let payload = Bytes::from(vec![0u8; 2 * 1024 * 1024]);

        let err = ft
            .queue_request(
                node,
                FileOperation::UploadBackup,
                Uuid::new_v4(),
                Some("big.tar.gz".to_string()),
                None,
                Some(payload),
            )
            .await
            .expect_err("too large");
        assert!(matches!(err, FileTunnelError::UploadTooLarge { limit_mb: 1 }));
        assert_eq!(ft.get_pending_count(node).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_pending_before_error_is_observed() {
        let ft = tunnel();
        let node = Uuid::new_v4();

        let waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    Uuid::new_v4(),
                    None,
                    None,
                    None,
                )
                .await
            }
        });

        tokio::time::advance(Duration::from_secs(11)).await;
        let err = waiter.await.expect("join").expect_err("timeout");
        assert_eq!(err, FileTunnelError::Timeout);
        assert_eq!(ft.get_pending_count(node).await, 0);

        // Late resolution finds nothing.
        assert!(!ft.resolve_request(node, "f-whatever", json!({})).await);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_returns_after_window() {
        let ft = tunnel();
        let node = Uuid::new_v4();

        let poller = tokio::spawn({
            let ft = ft.clone();
            async move { ft.poll_requests(node).await }
        });
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(poller.await.expect("join").is_empty());
        assert!(!ft.is_node_connected(node).await);
    }

    #[tokio::test]
    async fn resolution_from_wrong_node_is_rejected() {
        let ft = tunnel();
        let node = Uuid::new_v4();
        let imposter = Uuid::new_v4();

        let waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::DownloadBackup,
                    Uuid::new_v4(),
                    Some("daily.tar.gz".to_string()),
                    None,
                    None,
                )
                .await
            }
        });
        tokio::task::yield_now().await;

        let batch = ft.poll_requests(node).await;
        let request_id = batch[0].request_id.clone();

        assert!(!ft.resolve_request(imposter, &request_id, json!({})).await);
        // The real node can still resolve it.
        assert!(ft.resolve_request(node, &request_id, json!({})).await);
        waiter.await.expect("join").expect("resolution");
    }

    #[tokio::test]
    async fn upload_staging_serves_only_the_owning_node() {
        let ft = tunnel();
        let node = Uuid::new_v4();
        let imposter = Uuid::new_v4();

        let _waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::UploadBackup,
                    Uuid::new_v4(),
                    Some("restore.tar.gz".to_string()),
                    None,
                    Some(Bytes::from_static(b"archive bytes")),
                )
                .await
            }
        });
        tokio::task::yield_now().await;

        let batch = ft.poll_requests(node).await;
        assert!(batch[0].has_upload);
        let request_id = batch[0].request_id.clone();

        assert!(ft.get_upload_data(imposter, &request_id).await.is_none());
        let data = ft.get_upload_data(node, &request_id).await.expect("data");
        assert_eq!(&data[..], b"archive bytes");
        // Fetch is non-destructive.
        assert!(ft.get_upload_data(node, &request_id).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_pollers_idempotently() {
        let ft = tunnel();
        let node = Uuid::new_v4();

        let waiter = tokio::spawn({
            let ft = ft.clone();
            async move {
                ft.queue_request(
                    node,
                    FileOperation::ReadDirectory,
                    Uuid::new_v4(),
                    None,
                    None,
                    None,
                )
                .await
            }
        });
        let poller = tokio::spawn({
            let ft = ft.clone();
            async move { ft.poll_requests(Uuid::new_v4()).await }
        });
        tokio::task::yield_now().await;

        ft.shutdown().await;
        ft.shutdown().await;

        let err = waiter.await.expect("join").expect_err("stopped");
        assert_eq!(err, FileTunnelError::Stopped);
        assert!(poller.await.expect("join").is_empty());

        // New work is refused after shutdown.
        let err = ft
            .queue_request(
                node,
                FileOperation::ReadDirectory,
                Uuid::new_v4(),
                None,
                None,
                None,
            )
            .await
            .expect_err("stopped");
        assert_eq!(err, FileTunnelError::Stopped);
        assert!(ft.poll_requests(node).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gc_sweep_removes_stale_uploads_and_pending() {
        let ft = tunnel();
        let node = Uuid::new_v4();
        let request_id = "f-stale".to_string();

        // Seed an abandoned request directly: the waiter's oneshot is gone,
        // only the staged state remains.
        {
            let mut state = ft.inner.lock().await;
            let (tx, _rx) = oneshot::channel();
            state.pending.insert(
                request_id.clone(),
                PendingRequest {
                    node_id: node,
                    response_tx: tx,
                    created_at: Instant::now(),
                },
            );
            state.uploads.insert(
                request_id.clone(),
                StagedUpload {
                    node_id: node,
                    data: Bytes::from_static(b"bytes"),
                    created_at: Instant::now(),
                },
            );
        }

        assert_eq!(ft.run_gc_sweep(Instant::now()).await, (0, 0));

        // Past the doubled request deadline but inside the upload TTL.
        tokio::time::advance(Duration::from_secs(30)).await;
        let (uploads, pending) = ft.run_gc_sweep(Instant::now()).await;
        assert_eq!((uploads, pending), (0, 1));
        assert_eq!(ft.get_pending_count(node).await, 0);

        // Past the upload TTL.
        tokio::time::advance(Duration::from_secs(40)).await;
        let (uploads, _pending) = ft.run_gc_sweep(Instant::now()).await;
        assert_eq!(uploads, 1);
    }
}
