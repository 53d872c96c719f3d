//! Backup transfer orchestration.
//!
//! Moves archives between agents and storage backends over the push tunnel.
//! The agent-facing side always streams through length-prefixed frames; the
//! storage side dispatches on the effective mode for the server.

pub mod backend;

pub use backend::{
    ensure_remote_dirs, LocalBackend, ObjectStoreClient, SftpClient, StorageMode, StoredObject,
};

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use common::wire::{encode_chunk, FileOperation, TunnelFrame};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BackupsConfig, TunnelConfig};
use crate::directory::ServerRecord;
use crate::error::{CommandError, FileTunnelError, TransferError};
use crate::file_tunnel::FileTunnel;
use crate::secrets::{self, SecretCipher};
use crate::tunnel::TunnelRegistry;

/// Chunk size for archive pushes toward the agent.
const PUSH_CHUNK_LEN: usize = 256 * 1024;

/// Completed transfer metadata returned to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDescriptor {
    pub server_uuid: Uuid,
    pub name: String,
    pub mode: StorageMode,
    pub size: u64,
    pub completed_at: DateTime<Utc>,
}

/// Read-back handle for a stored archive.
pub enum BackupStream {
    File(tokio::fs::File),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Channel(mpsc::Receiver<Bytes>),
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    registry: TunnelRegistry,
    file_tunnel: FileTunnel,
    cfg: BackupsConfig,
    command_timeout: Duration,
    stream_timeout: Duration,
    cipher: Option<SecretCipher>,
    object_store: Option<Arc<dyn ObjectStoreClient>>,
    sftp: Option<Arc<dyn SftpClient>>,
    local: LocalBackend,
}

impl BackupOrchestrator {
    pub fn new(
        registry: TunnelRegistry,
        file_tunnel: FileTunnel,
        cfg: BackupsConfig,
        tunnel: &TunnelConfig,
        cipher: Option<SecretCipher>,
        object_store: Option<Arc<dyn ObjectStoreClient>>,
        sftp: Option<Arc<dyn SftpClient>>,
    ) -> Self {
        let local = LocalBackend::new(cfg.local_dir.clone());
        Self {
            registry,
            file_tunnel,
            cfg,
            command_timeout: tunnel.command_timeout(),
            stream_timeout: tunnel.stream_timeout(),
            cipher,
            object_store,
            sftp,
            local,
        }
    }

    /// Effective storage mode for a server: its override, or the global one.
    pub fn resolve_mode(&self, server: &ServerRecord) -> StorageMode {
        server.backup_mode.unwrap_or(self.cfg.mode)
    }

    fn archive_file_name(name: &str) -> String {
        if name.ends_with(".tar.gz") {
            name.to_string()
        } else {
            format!("{name}.tar.gz")
        }
    }

    fn validate_name(name: &str) -> Result<(), TransferError> {
        if name.is_empty() {
            return Err(TransferError::InvalidName("name is empty".to_string()));
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(TransferError::InvalidName(format!(
                "name must not contain path separators or traversal: {name}"
            )));
        }
        Ok(())
    }

    /// Agent-side path of an archive: `<base|stream>/<serverUuid>/<file>`.
    fn agent_archive_path(&self, mode: StorageMode, server_uuid: Uuid, file: &str) -> String {
        let dir = match mode {
            StorageMode::Stream => &self.cfg.stream_dir,
            _ => &self.cfg.base_dir,
        };
        format!("{}/{}/{}", dir.trim_end_matches('/'), server_uuid, file)
    }

    fn s3_key(server_uuid: Uuid, file: &str) -> String {
        format!("{server_uuid}/{file}")
    }

    fn sftp_dir(&self, server_uuid: Uuid) -> String {
        format!(
            "{}/{}",
            self.cfg.sftp.base_path.trim_end_matches('/'),
            server_uuid
        )
    }

    fn sftp_path(&self, server_uuid: Uuid, file: &str) -> String {
        format!("{}/{}", self.sftp_dir(server_uuid), file)
    }

    /// Ensures a credential value is usable before a transfer starts: an
    /// encrypted envelope with no working key fails here, not mid-stream.
    fn check_credential(&self, field: &str, value: &str) -> Result<(), TransferError> {
        if value.is_empty() || !secrets::is_envelope(value) {
            return Ok(());
        }
        let Some(cipher) = &self.cipher else {
            return Err(TransferError::Config(format!(
                "{field} is encrypted but no master key is configured"
            )));
        };
        cipher
            .decrypt(value)
            .map(|_| ())
            .map_err(|err| TransferError::Config(format!("{field} cannot be decrypted: {err}")))
    }

    /// Fails fast on storage configuration problems before any agent work.
    fn preflight(&self, mode: StorageMode) -> Result<(), TransferError> {
        match mode {
            StorageMode::Local | StorageMode::Stream => Ok(()),
            StorageMode::S3 => {
                if self.object_store.is_none() {
                    return Err(TransferError::Config(
                        "s3 mode selected but no object store client is wired".to_string(),
                    ));
                }
                if self.cfg.s3.bucket.is_empty() {
                    return Err(TransferError::Config("s3 bucket is not set".to_string()));
                }
                self.check_credential("s3 secret key", &self.cfg.s3.secret_key)
            }
            StorageMode::Sftp => {
                if self.sftp.is_none() {
                    return Err(TransferError::Config(
                        "sftp mode selected but no sftp client is wired".to_string(),
                    ));
                }
                if self.cfg.sftp.host.is_empty() {
                    return Err(TransferError::Config("sftp host is not set".to_string()));
                }
                if self.cfg.sftp.base_path.is_empty() {
                    return Err(TransferError::Config(
                        "sftp base path is not set".to_string(),
                    ));
                }
                for (field, value) in [
                    ("sftp password", self.cfg.sftp.password.as_deref()),
                    ("sftp private key", self.cfg.sftp.private_key.as_deref()),
                    ("sftp passphrase", self.cfg.sftp.passphrase.as_deref()),
                ] {
                    if let Some(value) = value {
                        self.check_credential(field, value)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Pulls an archive off the agent and stores it on the effective backend.
    pub async fn store_backup(
        &self,
        server: &ServerRecord,
        name: &str,
    ) -> Result<BackupDescriptor, TransferError> {
        Self::validate_name(name)?;
        let mode = self.resolve_mode(server);
        self.preflight(mode)?;

        let file = Self::archive_file_name(name);
        let agent_path = self.agent_archive_path(mode, server.uuid, &file);
        let started = std::time::Instant::now();

        let mut stream = self
            .registry
            .stream_binary(
                server.node_id,
                TunnelFrame::DownloadBackupStart {
                    request_id: None,
                    server_uuid: server.uuid,
                    backup_path: agent_path,
                },
                self.stream_timeout,
            )
            .await?;

        let size = match mode {
            StorageMode::Local | StorageMode::Stream => {
                self.store_to_local(server.uuid, &file, &mut stream).await?
            }
            StorageMode::S3 => self.store_to_s3(server.uuid, &file, &mut stream).await?,
            StorageMode::Sftp => self.store_to_sftp(server.uuid, &file, &mut stream).await?,
        };

        histogram!(
            "aero_cp_backup_transfer_bytes",
            "direction" => "store",
            "mode" => mode.as_str(),
        )
        .record(size as f64);
        counter!("aero_cp_backup_transfers_total", "direction" => "store", "mode" => mode.as_str())
            .increment(1);
        info!(
            server_uuid = %server.uuid,
            name = %file,
            mode = %mode,
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backup stored"
        );

        Ok(BackupDescriptor {
            server_uuid: server.uuid,
            name: file,
            mode,
            size,
            completed_at: Utc::now(),
        })
    }

    async fn store_to_local(
        &self,
        server_uuid: Uuid,
        file: &str,
        stream: &mut crate::tunnel::BinaryStream,
    ) -> Result<u64, TransferError> {
        let (path, mut out) = self.local.create_writer(server_uuid, file).await?;
        let mut written: u64 = 0;
        loop {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    out.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(err) => {
                    // Never leave a partial archive behind.
                    drop(out);
                    if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                        warn!(?cleanup, path = %path.display(), "failed to remove partial archive");
                    }
                    return Err(err.into());
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }

    async fn store_to_s3(
        &self,
        server_uuid: Uuid,
        file: &str,
        stream: &mut crate::tunnel::BinaryStream,
    ) -> Result<u64, TransferError> {
        let client = self
            .object_store
            .clone()
            .ok_or_else(|| TransferError::Config("object store client missing".to_string()))?;
        let bucket = self.cfg.s3.bucket.clone();
        let key = Self::s3_key(server_uuid, file);

        let (tx, rx) = mpsc::channel::<Bytes>(8);
        let upload = tokio::spawn({
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();
            async move { client.put_object(&bucket, &key, rx).await }
        });

        let mut written: u64 = 0;
        let pump_result = loop {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    written += chunk.len() as u64;
                    if tx.send(chunk).await.is_err() {
                        break Err(TransferError::Backend(anyhow::anyhow!(
                            "object store upload ended early"
                        )));
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err.into()),
            }
        };
        drop(tx);

        match pump_result {
            Ok(()) => {
                upload
                    .await
                    .map_err(|err| TransferError::Backend(anyhow::anyhow!(err)))?
                    .map_err(TransferError::Backend)?;
                Ok(written)
            }
            Err(err) => {
                upload.abort();
                if let Err(cleanup) = client.delete_object(&bucket, &key).await {
                    debug!(?cleanup, %key, "failed to clean up aborted upload");
                }
                Err(err)
            }
        }
    }

    async fn store_to_sftp(
        &self,
        server_uuid: Uuid,
        file: &str,
        stream: &mut crate::tunnel::BinaryStream,
    ) -> Result<u64, TransferError> {
        let sftp = self
            .sftp
            .clone()
            .ok_or_else(|| TransferError::Config("sftp client missing".to_string()))?;

        ensure_remote_dirs(sftp.as_ref(), &self.sftp_dir(server_uuid))
            .await
            .map_err(TransferError::Backend)?;

        let path = self.sftp_path(server_uuid, file);
        let mut out = sftp.open_write(&path).await.map_err(TransferError::Backend)?;
        let mut written: u64 = 0;
        loop {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    out.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(err) => {
                    drop(out);
                    if let Err(cleanup) = sftp.remove(&path).await {
                        debug!(?cleanup, %path, "failed to remove partial remote archive");
                    }
                    return Err(err.into());
                }
            }
        }
        out.shutdown().await?;
        Ok(written)
    }

    /// Pushes a stored archive back to the agent under a single transfer id:
    /// `upload_backup_start`, ordered chunk frames, `upload_backup_complete`.
    /// A node with no push tunnel but a parked poller gets the archive as a
    /// staged upload over the file tunnel instead.
    pub async fn restore_backup(
        &self,
        server: &ServerRecord,
        name: &str,
    ) -> Result<u64, TransferError> {
        Self::validate_name(name)?;
        let mode = self.resolve_mode(server);
        self.preflight(mode)?;

        let file = Self::archive_file_name(name);
        let agent_path = self.agent_archive_path(mode, server.uuid, &file);

        if !self.registry.contains(server.node_id).await {
            let pushed = self
                .restore_via_file_tunnel(server, mode, &file, &agent_path)
                .await?;
            self.record_restore(server, mode, &file, pushed);
            return Ok(pushed);
        }

        let transfer_id = format!("t-{}", Uuid::new_v4());
        let mut source = self.open_source(mode, server.uuid, &file).await?;

        self.registry
            .request_with_id(
                server.node_id,
                TunnelFrame::UploadBackupStart {
                    request_id: None,
                    server_uuid: server.uuid,
                    backup_path: agent_path,
                },
                transfer_id.clone(),
                self.command_timeout,
            )
            .await?;

        let mut pushed: u64 = 0;
        loop {
            let chunk = Self::read_source_chunk(&mut source).await?;
            let Some(chunk) = chunk else { break };
            if chunk.is_empty() {
                continue;
            }
            pushed += chunk.len() as u64;
            self.registry
                .push(
                    server.node_id,
                    TunnelFrame::UploadBackupChunk {
                        request_id: Some(transfer_id.clone()),
                        chunk: encode_chunk(&chunk),
                    },
                )
                .await?;
        }

        self.registry
            .request_with_id(
                server.node_id,
                TunnelFrame::UploadBackupComplete { request_id: None },
                transfer_id,
                self.command_timeout,
            )
            .await?;

        self.record_restore(server, mode, &file, pushed);
        Ok(pushed)
    }

    fn record_restore(&self, server: &ServerRecord, mode: StorageMode, file: &str, pushed: u64) {
        histogram!(
            "aero_cp_backup_transfer_bytes",
            "direction" => "restore",
            "mode" => mode.as_str(),
        )
        .record(pushed as f64);
        counter!("aero_cp_backup_transfers_total", "direction" => "restore", "mode" => mode.as_str())
            .increment(1);
        info!(server_uuid = %server.uuid, name = %file, mode = %mode, pushed, "backup restored");
    }

    /// Stages the whole archive for a polling node and waits for the agent
    /// to fetch and apply it. Archives above the file tunnel's upload limit
    /// cannot travel this path.
    async fn restore_via_file_tunnel(
        &self,
        server: &ServerRecord,
        mode: StorageMode,
        file: &str,
        agent_path: &str,
    ) -> Result<u64, TransferError> {
        if !self.file_tunnel.is_node_connected(server.node_id).await {
            return Err(CommandError::NoTunnel.into());
        }

        let limit = self.file_tunnel.config().max_upload_bytes();
        let mut source = self.open_source(mode, server.uuid, file).await?;
        let mut payload = BytesMut::new();
        loop {
            let Some(chunk) = Self::read_source_chunk(&mut source).await? else {
                break;
            };
            if payload.len() as u64 + chunk.len() as u64 > limit {
                return Err(FileTunnelError::UploadTooLarge {
                    limit_mb: self.file_tunnel.config().max_upload_mb,
                }
                .into());
            }
            payload.extend_from_slice(&chunk);
        }

        let pushed = payload.len() as u64;
        self.file_tunnel
            .queue_request(
                server.node_id,
                FileOperation::UploadBackup,
                server.uuid,
                Some(agent_path.to_string()),
                None,
                Some(payload.freeze()),
            )
            .await?;
        Ok(pushed)
    }

    async fn open_source(
        &self,
        mode: StorageMode,
        server_uuid: Uuid,
        file: &str,
    ) -> Result<BackupStream, TransferError> {
        match mode {
            StorageMode::Local | StorageMode::Stream => {
                match self.local.open_reader(server_uuid, file).await {
                    Ok(reader) => Ok(BackupStream::File(reader)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        Err(TransferError::NotFound(file.to_string()))
                    }
                    Err(err) => Err(err.into()),
                }
            }
            StorageMode::S3 => {
                let client = self
                    .object_store
                    .clone()
                    .ok_or_else(|| TransferError::Config("object store client missing".into()))?;
                let rx = client
                    .get_object(&self.cfg.s3.bucket, &Self::s3_key(server_uuid, file))
                    .await
                    .map_err(TransferError::Backend)?;
                Ok(BackupStream::Channel(rx))
            }
            StorageMode::Sftp => {
                let sftp = self
                    .sftp
                    .clone()
                    .ok_or_else(|| TransferError::Config("sftp client missing".into()))?;
                let reader = sftp
                    .open_read(&self.sftp_path(server_uuid, file))
                    .await
                    .map_err(TransferError::Backend)?;
                Ok(BackupStream::Reader(reader))
            }
        }
    }

    async fn read_source_chunk(source: &mut BackupStream) -> Result<Option<Bytes>, TransferError> {
        match source {
            BackupStream::File(file) => read_chunk_from(file).await,
            BackupStream::Reader(reader) => read_chunk_from(reader).await,
            BackupStream::Channel(rx) => Ok(rx.recv().await),
        }
    }

    /// Opens a stored archive for operator download.
    pub async fn open_backup(
        &self,
        server: &ServerRecord,
        name: &str,
    ) -> Result<BackupStream, TransferError> {
        Self::validate_name(name)?;
        let mode = self.resolve_mode(server);
        self.preflight(mode)?;
        self.open_source(mode, server.uuid, &Self::archive_file_name(name))
            .await
    }

    /// Deletes a stored archive. For plane-local modes a missing file falls
    /// back to a best-effort delete on the agent, since the archive may only
    /// exist on the node.
    pub async fn delete_backup(
        &self,
        server: &ServerRecord,
        name: &str,
    ) -> Result<(), TransferError> {
        Self::validate_name(name)?;
        let mode = self.resolve_mode(server);
        self.preflight(mode)?;
        let file = Self::archive_file_name(name);

        match mode {
            StorageMode::Local | StorageMode::Stream => {
                match self.local.remove(server.uuid, &file).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        self.delete_on_agent(server, mode, &file).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            StorageMode::S3 => {
                let client = self
                    .object_store
                    .clone()
                    .ok_or_else(|| TransferError::Config("object store client missing".into()))?;
                client
                    .delete_object(&self.cfg.s3.bucket, &Self::s3_key(server.uuid, &file))
                    .await
                    .map_err(TransferError::Backend)?;
            }
            StorageMode::Sftp => {
                let sftp = self
                    .sftp
                    .clone()
                    .ok_or_else(|| TransferError::Config("sftp client missing".into()))?;
                sftp.remove(&self.sftp_path(server.uuid, &file))
                    .await
                    .map_err(TransferError::Backend)?;
            }
        }

        counter!("aero_cp_backup_deletes_total", "mode" => mode.as_str()).increment(1);
        Ok(())
    }

    /// Best-effort removal of an archive that lives on the agent. Failures
    /// are logged, never surfaced: the plane-side state is already gone.
    async fn delete_on_agent(&self, server: &ServerRecord, mode: StorageMode, file: &str) {
        let backup_path = self.agent_archive_path(mode, server.uuid, file);
        if self.registry.contains(server.node_id).await {
            let frame = TunnelFrame::DeleteBackup {
                request_id: None,
                server_uuid: server.uuid,
                backup_path,
            };
            if let Err(err) = self.registry.send(server.node_id, frame).await {
                debug!(?err, server_uuid = %server.uuid, "agent delete not delivered");
            }
            return;
        }

        if self.file_tunnel.is_node_connected(server.node_id).await {
            let file_tunnel = self.file_tunnel.clone();
            let node_id = server.node_id;
            let server_uuid = server.uuid;
            let file = file.to_string();
            tokio::spawn(async move {
                if let Err(err) = file_tunnel
                    .queue_request(
                        node_id,
                        FileOperation::DeleteBackup,
                        server_uuid,
                        Some(file),
                        None,
                        None,
                    )
                    .await
                {
                    debug!(?err, %server_uuid, "file tunnel delete not delivered");
                }
            });
        }
    }

    /// Lists stored archives for a server on its effective backend.
    pub async fn list_backups(
        &self,
        server: &ServerRecord,
    ) -> Result<Vec<StoredObject>, TransferError> {
        let mode = self.resolve_mode(server);
        self.preflight(mode)?;
        match mode {
            StorageMode::Local | StorageMode::Stream => Ok(self.local.list(server.uuid).await?),
            StorageMode::S3 => {
                let client = self
                    .object_store
                    .clone()
                    .ok_or_else(|| TransferError::Config("object store client missing".into()))?;
                client
                    .list_objects(&self.cfg.s3.bucket, &format!("{}/", server.uuid))
                    .await
                    .map_err(TransferError::Backend)
            }
            StorageMode::Sftp => {
                let sftp = self
                    .sftp
                    .clone()
                    .ok_or_else(|| TransferError::Config("sftp client missing".into()))?;
                sftp.list_dir(&self.sftp_dir(server.uuid))
                    .await
                    .map_err(TransferError::Backend)
            }
        }
    }

    /// Applies the configured retention rules and returns how many archives
    /// were removed.
    pub async fn apply_retention(&self, server: &ServerRecord) -> Result<usize, TransferError> {
        let (count, days) = self.cfg.retention.clamped();
        if count == 0 && days == 0 {
            return Ok(0);
        }

        let objects = self.list_backups(server).await?;
        let victims = retention_victims(objects, count, days, Utc::now());
        let removed = victims.len();
        for key in victims {
            self.delete_backup(server, &key).await?;
        }
        if removed > 0 {
            info!(server_uuid = %server.uuid, removed, "retention removed archives");
        }
        Ok(removed)
    }

    /// Directory listing of a server's files, serviced over the long-poll
    /// file tunnel.
    pub async fn read_remote_directory(
        &self,
        server: &ServerRecord,
        path: &str,
    ) -> Result<serde_json::Value, TransferError> {
        let listing = self
            .file_tunnel
            .queue_request(
                server.node_id,
                FileOperation::ReadDirectory,
                server.uuid,
                Some(path.to_string()),
                None,
                None,
            )
            .await?;
        Ok(listing)
    }
}

async fn read_chunk_from<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Bytes>, TransferError> {
    let mut buf = vec![0u8; PUSH_CHUNK_LEN];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(Bytes::from(buf)))
}

/// Keys of archives the retention rules say to remove. `count` keeps the
/// newest N archives; `days` removes anything older than the window. Either
/// rule set to zero is disabled.
fn retention_victims(
    mut objects: Vec<StoredObject>,
    count: u64,
    days: u64,
    now: DateTime<Utc>,
) -> Vec<String> {
    // Newest first; unknown timestamps sort oldest so they age out first.
    objects.sort_by(|a, b| b.modified.cmp(&a.modified));

    let mut victims = Vec::new();
    for (index, object) in objects.iter().enumerate() {
        let over_count = count > 0 && index as u64 >= count;
        let too_old = days > 0
            && object
                .modified
                .map(|modified| now - modified > chrono::Duration::days(days as i64))
                .unwrap_or(true);
        if over_count || too_old {
            victims.push(object.key.clone());
        }
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetentionConfig, S3Config, SftpConfig};
    use crate::tunnel::registry::{AgentCommand, StreamEvent};
    use common::wire::decode_chunk;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn backups_config(local_dir: &str) -> BackupsConfig {
        BackupsConfig {
            mode: StorageMode::Local,
            base_dir: "/var/lib/aero/volumes".to_string(),
            stream_dir: "/var/lib/aero/stream".to_string(),
            local_dir: local_dir.to_string(),
            retention: RetentionConfig { count: 0, days: 0 },
            s3: S3Config::default(),
            sftp: SftpConfig::default(),
        }
    }

    fn tunnel_config() -> TunnelConfig {
        TunnelConfig {
            host: "127.0.0.1".to_string(),
            port: 7443,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            token_header: "x-aero-tunnel-token".to_string(),
            agent_tokens: vec!["token".to_string()],
            command_timeout_secs: 5,
            stream_timeout_secs: 30,
        }
    }

    fn file_tunnel() -> FileTunnel {
        FileTunnel::new(crate::config::FileTunnelConfig {
            max_pending_per_node: 8,
            max_upload_mb: 10,
            request_timeout_secs: 5,
            poll_timeout_secs: 5,
            upload_ttl_secs: 60,
            gc_interval_secs: 60,
        })
    }

    fn server_on(node_id: Uuid) -> ServerRecord {
        ServerRecord {
            id: 1,
            uuid: Uuid::new_v4(),
            node_id,
            name: "srv".to_string(),
            backup_mode: None,
            storage: None,
        }
    }

    fn orchestrator(local_dir: &str, registry: TunnelRegistry) -> BackupOrchestrator {
        BackupOrchestrator::new(
            registry,
            file_tunnel(),
            backups_config(local_dir),
            &tunnel_config(),
            None,
            None,
            None,
        )
    }

    async fn register_fake_agent(
        registry: &TunnelRegistry,
        node_id: Uuid,
    ) -> tokio::sync::mpsc::Receiver<AgentCommand> {
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        registry
            .upsert(node_id, Uuid::new_v4(), tx, Arc::new(Semaphore::new(4)))
            .await;
        rx
    }

    #[test]
    fn names_with_traversal_are_rejected() {
        assert!(BackupOrchestrator::validate_name("daily").is_ok());
        assert!(BackupOrchestrator::validate_name("daily.tar.gz").is_ok());
        assert!(BackupOrchestrator::validate_name("").is_err());
        assert!(BackupOrchestrator::validate_name("../etc/passwd").is_err());
        assert!(BackupOrchestrator::validate_name("a/b").is_err());
        assert!(BackupOrchestrator::validate_name("a\\b").is_err());
    }

    #[test]
    fn archive_names_get_canonical_suffix() {
        assert_eq!(
            BackupOrchestrator::archive_file_name("daily"),
            "daily.tar.gz"
        );
        assert_eq!(
            BackupOrchestrator::archive_file_name("daily.tar.gz"),
            "daily.tar.gz"
        );
    }

    #[tokio::test]
    async fn store_backup_writes_local_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let mut commands = register_fake_agent(&registry, node_id).await;
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);
        let server_uuid = server.uuid;

        let agent = tokio::spawn(async move {
            if let Some(AgentCommand::Stream {
                frame, events_tx, ..
            }) = commands.recv().await
            {
                match frame {
                    TunnelFrame::DownloadBackupStart {
                        server_uuid: uuid,
                        backup_path,
                        ..
                    } => {
                        assert_eq!(uuid, server_uuid);
                        assert!(backup_path
                            .starts_with(&format!("/var/lib/aero/volumes/{server_uuid}/")));
                    }
                    other => panic!("unexpected frame {other:?}"),
                }
                for chunk in [&b"tar "[..], &b"bytes"[..]] {
                    events_tx
                        .send(StreamEvent::Chunk(Bytes::copy_from_slice(chunk)))
                        .await
                        .expect("chunk");
                }
                events_tx.send(StreamEvent::End).await.expect("end");
            }
        });

        let descriptor = orch.store_backup(&server, "daily").await.expect("store");
        assert_eq!(descriptor.name, "daily.tar.gz");
        assert_eq!(descriptor.size, 9);
        assert_eq!(descriptor.mode, StorageMode::Local);

        let stored = tokio::fs::read(
            dir.path()
                .join(server.uuid.to_string())
                .join("daily.tar.gz"),
        )
        .await
        .expect("read back");
        assert_eq!(stored, b"tar bytes");
        agent.await.expect("agent");
    }

    #[tokio::test]
    async fn failed_store_leaves_no_partial_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let mut commands = register_fake_agent(&registry, node_id).await;
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);

        let agent = tokio::spawn(async move {
            if let Some(AgentCommand::Stream { events_tx, .. }) = commands.recv().await {
                events_tx
                    .send(StreamEvent::Chunk(Bytes::from_static(b"partial")))
                    .await
                    .expect("chunk");
                events_tx
                    .send(StreamEvent::Error("archive vanished".to_string()))
                    .await
                    .expect("error");
            }
        });

        let err = orch
            .store_backup(&server, "daily")
            .await
            .expect_err("remote failure");
        assert!(err.to_string().contains("archive vanished"));

        let path = dir
            .path()
            .join(server.uuid.to_string())
            .join("daily.tar.gz");
        assert!(!path.exists());
        agent.await.expect("agent");
    }

    #[tokio::test]
    async fn restore_pushes_chunks_under_one_transfer_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let mut commands = register_fake_agent(&registry, node_id).await;
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);

        // Seed the stored archive.
        let server_dir = dir.path().join(server.uuid.to_string());
        tokio::fs::create_dir_all(&server_dir).await.expect("dir");
        tokio::fs::write(server_dir.join("daily.tar.gz"), b"restored payload")
            .await
            .expect("seed");

        let agent = tokio::spawn(async move {
            let mut transfer_id = None;
            let mut restored = Vec::new();
            while let Some(command) = commands.recv().await {
                match command {
                    AgentCommand::Request {
                        request_id,
                        frame,
                        response_tx,
                        ..
                    } => match frame {
                        TunnelFrame::UploadBackupStart { .. } => {
                            transfer_id = Some(request_id);
                            let _ = response_tx.send(Ok(serde_json::Value::Null));
                        }
                        TunnelFrame::UploadBackupComplete { .. } => {
                            assert_eq!(Some(request_id), transfer_id);
                            let _ = response_tx.send(Ok(serde_json::Value::Null));
                            break;
                        }
                        other => panic!("unexpected request {other:?}"),
                    },
                    AgentCommand::Send { frame } => match frame {
                        TunnelFrame::UploadBackupChunk { request_id, chunk } => {
                            assert_eq!(request_id, transfer_id);
                            restored
                                .extend_from_slice(&decode_chunk(&chunk).expect("decode chunk"));
                        }
                        other => panic!("unexpected send {other:?}"),
                    },
                    other => panic!("unexpected command {other:?}"),
                }
            }
            restored
        });

        let pushed = orch.restore_backup(&server, "daily").await.expect("restore");
        assert_eq!(pushed, 16);
        let restored = agent.await.expect("agent");
        assert_eq!(restored, b"restored payload");
    }

    #[tokio::test]
    async fn restore_stages_upload_for_polling_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);

        let server_dir = dir.path().join(server.uuid.to_string());
        tokio::fs::create_dir_all(&server_dir).await.expect("dir");
        tokio::fs::write(server_dir.join("daily.tar.gz"), b"poll payload")
            .await
            .expect("seed");

        // The agent side: park a poller, fetch the staged archive, resolve.
        let file_tunnel = orch.file_tunnel.clone();
        let server_uuid = server.uuid;
        let agent = tokio::spawn(async move {
            let batch = file_tunnel.poll_requests(node_id).await;
            assert_eq!(batch.len(), 1);
            let request = &batch[0];
            assert_eq!(request.operation, FileOperation::UploadBackup);
            assert!(request.has_upload);
            assert!(request
                .path
                .as_deref()
                .expect("path")
                .starts_with(&format!("/var/lib/aero/volumes/{server_uuid}/")));

            let data = file_tunnel
                .get_upload_data(node_id, &request.request_id)
                .await
                .expect("staged bytes");
            assert_eq!(&data[..], b"poll payload");

            assert!(
                file_tunnel
                    .resolve_request(node_id, &request.request_id, serde_json::Value::Null)
                    .await
            );
        });

        // Let the poller park before the transfer starts.
        tokio::task::yield_now().await;

        let pushed = orch.restore_backup(&server, "daily").await.expect("restore");
        assert_eq!(pushed, 12);
        agent.await.expect("agent");
    }

    #[tokio::test]
    async fn restore_without_any_transport_reports_no_tunnel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(Uuid::new_v4());

        let err = orch
            .restore_backup(&server, "daily")
            .await
            .expect_err("no transport");
        assert!(matches!(
            err,
            TransferError::Command(CommandError::NoTunnel)
        ));
    }

    #[tokio::test]
    async fn restore_of_missing_archive_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let _commands = register_fake_agent(&registry, node_id).await;
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);

        let err = orch
            .restore_backup(&server, "missing")
            .await
            .expect_err("not found");
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn s3_mode_without_client_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let mut server = server_on(node_id);
        server.backup_mode = Some(StorageMode::S3);

        let err = orch
            .store_backup(&server, "daily")
            .await
            .expect_err("config");
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[tokio::test]
    async fn encrypted_credential_without_key_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let mut orch = orchestrator(dir.path().to_str().unwrap(), registry);
        orch.cfg.sftp.host = "sftp.example.com".to_string();
        orch.cfg.sftp.base_path = "/backups".to_string();
        orch.cfg.sftp.password = Some("v1:bm90LXJlYWw=".to_string());
        orch.sftp = Some(Arc::new(NoopSftp));
        let mut server = server_on(node_id);
        server.backup_mode = Some(StorageMode::Sftp);

        let err = orch
            .store_backup(&server, "daily")
            .await
            .expect_err("config");
        match err {
            TransferError::Config(message) => {
                assert!(message.contains("no master key"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_of_missing_local_archive_falls_back_to_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = TunnelRegistry::new();
        let node_id = Uuid::new_v4();
        let mut commands = register_fake_agent(&registry, node_id).await;
        let orch = orchestrator(dir.path().to_str().unwrap(), registry);
        let server = server_on(node_id);

        orch.delete_backup(&server, "gone").await.expect("delete");

        let command = commands.recv().await.expect("agent delete");
        match command {
            AgentCommand::Send {
                frame: TunnelFrame::DeleteBackup { backup_path, .. },
            } => {
                assert!(backup_path.ends_with("gone.tar.gz"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn retention_keeps_newest_and_drops_old() {
        let now = Utc::now();
        let objects = vec![
            StoredObject {
                key: "old.tar.gz".to_string(),
                size: 1,
                modified: Some(now - chrono::Duration::days(40)),
            },
            StoredObject {
                key: "recent.tar.gz".to_string(),
                size: 1,
                modified: Some(now - chrono::Duration::days(2)),
            },
            StoredObject {
                key: "newest.tar.gz".to_string(),
                size: 1,
                modified: Some(now - chrono::Duration::hours(1)),
            },
        ];

        // Count rule alone.
        let victims = retention_victims(objects.clone(), 2, 0, now);
        assert_eq!(victims, vec!["old.tar.gz"]);

        // Age rule alone.
        let victims = retention_victims(objects.clone(), 0, 30, now);
        assert_eq!(victims, vec!["old.tar.gz"]);

        // Both rules combine.
        let victims = retention_victims(objects, 1, 30, now);
        assert_eq!(victims, vec!["recent.tar.gz", "old.tar.gz"]);
    }

    #[test]
    fn retention_treats_unknown_timestamps_as_oldest() {
        let now = Utc::now();
        let objects = vec![
            StoredObject {
                key: "dated.tar.gz".to_string(),
                size: 1,
                modified: Some(now),
            },
            StoredObject {
                key: "undated.tar.gz".to_string(),
                size: 1,
                modified: None,
            },
        ];
        let victims = retention_victims(objects, 0, 7, now);
        assert_eq!(victims, vec!["undated.tar.gz"]);
    }

    struct NoopSftp;

    #[async_trait::async_trait]
    impl SftpClient for NoopSftp {
        async fn exists(&self, _path: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn create_dir(&self, _path: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn open_write(
            &self,
            _path: &str,
        ) -> anyhow::Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
            anyhow::bail!("not used")
        }
        async fn open_read(
            &self,
            _path: &str,
        ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
            anyhow::bail!("not used")
        }
        async fn remove(&self, _path: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_dir(&self, _path: &str) -> anyhow::Result<Vec<StoredObject>> {
            Ok(Vec::new())
        }
    }
}
