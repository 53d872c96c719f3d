//! Storage backend seams for backup archives.
//!
//! The plane itself only implements the local filesystem backend; S3 and
//! SFTP are collaborator traits a deployment wires in. Keeping them as
//! traits also gives the orchestrator tests cheap fakes.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where a server's backup archives live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Local,
    S3,
    Sftp,
    /// Agent streams through the plane into the plane-local stream directory.
    Stream,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::S3 => "s3",
            StorageMode::Sftp => "sftp",
            StorageMode::Stream => "stream",
        }
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "s3" => Ok(StorageMode::S3),
            "sftp" => Ok(StorageMode::Sftp),
            "stream" => Ok(StorageMode::Stream),
            other => Err(format!("unknown storage mode: {other}")),
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored archive as reported by a backend listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// S3-compatible object store operations the orchestrator needs.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Uploads an object from a channel of chunks. The call completes when
    /// the channel closes and the upload is durable.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<()>;

    /// Downloads an object as a channel of chunks.
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<mpsc::Receiver<Bytes>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> anyhow::Result<()>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<StoredObject>>;
}

/// SFTP operations the orchestrator needs.
#[async_trait]
pub trait SftpClient: Send + Sync {
    /// Whether a remote path exists. Implementations must return `Ok(false)`
    /// only for a clean not-found; any other probe failure is an error so a
    /// flaky server cannot masquerade as an empty directory.
    async fn exists(&self, path: &str) -> anyhow::Result<bool>;

    async fn create_dir(&self, path: &str) -> anyhow::Result<()>;

    async fn open_write(&self, path: &str)
        -> anyhow::Result<Box<dyn AsyncWrite + Send + Unpin>>;

    async fn open_read(&self, path: &str) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn remove(&self, path: &str) -> anyhow::Result<()>;

    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<StoredObject>>;
}

/// Creates each missing segment of `path` on the remote, parent first.
pub async fn ensure_remote_dirs(sftp: &dyn SftpClient, path: &str) -> anyhow::Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if path.starts_with('/') || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        if !sftp.exists(&current).await? {
            sftp.create_dir(&current).await?;
        }
    }
    Ok(())
}

/// Filesystem backend used for `local` mode and as the relay buffer for
/// `stream` mode.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, server_uuid: Uuid, name: &str) -> PathBuf {
        self.root.join(server_uuid.to_string()).join(name)
    }

    pub async fn create_writer(
        &self,
        server_uuid: Uuid,
        name: &str,
    ) -> std::io::Result<(PathBuf, fs::File)> {
        let path = self.archive_path(server_uuid, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&path).await?;
        Ok((path, file))
    }

    pub async fn open_reader(&self, server_uuid: Uuid, name: &str) -> std::io::Result<fs::File> {
        fs::File::open(self.archive_path(server_uuid, name)).await
    }

    pub async fn remove(&self, server_uuid: Uuid, name: &str) -> std::io::Result<()> {
        fs::remove_file(self.archive_path(server_uuid, name)).await
    }

    pub async fn list(&self, server_uuid: Uuid) -> std::io::Result<Vec<StoredObject>> {
        let dir = self.root.join(server_uuid.to_string());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            objects.push(StoredObject {
                key: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn storage_mode_parses_known_values() {
        assert_eq!("local".parse::<StorageMode>(), Ok(StorageMode::Local));
        assert_eq!("stream".parse::<StorageMode>(), Ok(StorageMode::Stream));
        assert!("ftp".parse::<StorageMode>().is_err());
    }

    #[tokio::test]
    async fn local_backend_round_trips_archives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::new(dir.path());
        let server = Uuid::new_v4();

        let (path, mut file) = backend
            .create_writer(server, "daily.tar.gz")
            .await
            .expect("writer");
        file.write_all(b"archive").await.expect("write");
        file.flush().await.expect("flush");
        drop(file);
        assert!(path.exists());

        let listing = backend.list(server).await.expect("list");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].key, "daily.tar.gz");
        assert_eq!(listing[0].size, 7);

        backend.remove(server, "daily.tar.gz").await.expect("remove");
        assert!(backend.list(server).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn listing_unknown_server_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::new(dir.path());
        assert!(backend.list(Uuid::new_v4()).await.expect("list").is_empty());
    }

    struct FakeSftp {
        existing: Mutex<HashSet<String>>,
        created: Mutex<Vec<String>>,
        fail_probe: bool,
    }

    #[async_trait]
    impl SftpClient for FakeSftp {
        async fn exists(&self, path: &str) -> anyhow::Result<bool> {
            if self.fail_probe {
                anyhow::bail!("connection reset");
            }
            Ok(self.existing.lock().unwrap().contains(path))
        }

        async fn create_dir(&self, path: &str) -> anyhow::Result<()> {
            self.existing.lock().unwrap().insert(path.to_string());
            self.created.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn open_write(
            &self,
            _path: &str,
        ) -> anyhow::Result<Box<dyn AsyncWrite + Send + Unpin>> {
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

    #[tokio::test]
    async fn ensure_remote_dirs_creates_missing_segments_in_order() {
        let sftp = FakeSftp {
            existing: Mutex::new(HashSet::from(["/backups".to_string()])),
            created: Mutex::new(Vec::new()),
            fail_probe: false,
        };

        ensure_remote_dirs(&sftp, "/backups/srv-1/2026")
            .await
            .expect("ensure");

        let created = sftp.created.lock().unwrap().clone();
        assert_eq!(created, vec!["/backups/srv-1", "/backups/srv-1/2026"]);
    }

    #[tokio::test]
    async fn ensure_remote_dirs_propagates_probe_failures() {
        let sftp = FakeSftp {
            existing: Mutex::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
            fail_probe: true,
        };

        let err = ensure_remote_dirs(&sftp, "/backups/srv-1")
            .await
            .expect_err("probe failure");
        assert!(err.to_string().contains("connection reset"));
        assert!(sftp.created.lock().unwrap().is_empty());
    }
}
