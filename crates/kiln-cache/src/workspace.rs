//! Run-scoped workspace snapshots on the local filesystem.
//!
//! Each run gets a namespace directory holding one compressed archive per
//! snapshot and a `manifest.json` describing them. Snapshots are never
//! modified after they are written; attaching extracts a private copy.

use crate::archiver::{self, Compression};
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::ports::WorkspaceStore;
use kiln_core::workspace::SnapshotInfo;
use kiln_core::{Error, JobName, Result, RunId, SnapshotId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct FilesystemWorkspaceStore {
    root_dir: PathBuf,
    compression: Compression,
    manifests: Mutex<HashMap<RunId, Vec<SnapshotInfo>>>,
}

fn workspace_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Workspace(format!("{context}: {e}"))
}

impl FilesystemWorkspaceStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            compression: Compression::Zstd,
            manifests: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root_dir.join(run_id.to_string())
    }

    fn archive_path(&self, run_id: RunId, snapshot_id: SnapshotId) -> PathBuf {
        self.run_dir(run_id).join(format!("{snapshot_id}.tar"))
    }

    async fn load_manifest(&self, run_id: RunId) -> Result<Vec<SnapshotInfo>> {
        let path = self.run_dir(run_id).join("manifest.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| workspace_error("corrupt workspace manifest", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(workspace_error("failed to read workspace manifest", e)),
        }
    }

    async fn write_manifest(&self, run_id: RunId, snapshots: &[SnapshotInfo]) -> Result<()> {
        let dir = self.run_dir(run_id);
        let tmp = dir.join("manifest.json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshots)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| workspace_error("failed to write workspace manifest", e))?;
        tokio::fs::rename(&tmp, dir.join("manifest.json"))
            .await
            .map_err(|e| workspace_error("failed to write workspace manifest", e))
    }

    async fn run_snapshots<'a>(
        &self,
        manifests: &'a mut HashMap<RunId, Vec<SnapshotInfo>>,
        run_id: RunId,
    ) -> Result<&'a mut Vec<SnapshotInfo>> {
        if !manifests.contains_key(&run_id) {
            let loaded = self.load_manifest(run_id).await?;
            manifests.insert(run_id, loaded);
        }
        Ok(manifests.entry(run_id).or_default())
    }
}

#[async_trait]
impl WorkspaceStore for FilesystemWorkspaceStore {
    async fn persist(
        &self,
        run_id: RunId,
        job: &JobName,
        root: &Path,
        paths: &[String],
    ) -> Result<SnapshotInfo> {
        let snapshot_id = SnapshotId::new();
        let run_dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| workspace_error("failed to create run namespace", e))?;

        let archive_path = self.archive_path(run_id, snapshot_id);
        let tmp_path = archive_path.with_extension("partial");
        let compression = self.compression;
        let paths_owned = paths.to_vec();
        let root_owned = root.to_path_buf();
        let tmp_owned = tmp_path.clone();
        let packed = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&tmp_owned)?;
            archiver::create_archive(file, &paths_owned, &root_owned, compression)
        })
        .await
        .map_err(|e| workspace_error("persist task failed", e))??;

        if packed == 0 {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Workspace(format!(
                "none of {:?} exist under {}",
                paths,
                root.display()
            )));
        }
        tokio::fs::rename(&tmp_path, &archive_path)
            .await
            .map_err(|e| workspace_error("failed to finalize snapshot", e))?;
        let size_bytes = tokio::fs::metadata(&archive_path)
            .await
            .map_err(|e| workspace_error("failed to stat snapshot", e))?
            .len();

        let info = SnapshotInfo {
            id: snapshot_id,
            run_id,
            job: job.clone(),
            paths: paths.to_vec(),
            size_bytes,
            created_at: Utc::now(),
        };

        let mut manifests = self.manifests.lock().await;
        let snapshots = self.run_snapshots(&mut manifests, run_id).await?;
        snapshots.push(info.clone());
        let snapshot_list = snapshots.clone();
        self.write_manifest(run_id, &snapshot_list).await?;

        info!(
            run_id = %run_id,
            job = %job,
            snapshot_id = %snapshot_id,
            size_bytes,
            "Workspace persisted"
        );
        Ok(info)
    }

    async fn attach(&self, run_id: RunId, snapshot_id: SnapshotId, mount_root: &Path) -> Result<()> {
        {
            let mut manifests = self.manifests.lock().await;
            let snapshots = self.run_snapshots(&mut manifests, run_id).await?;
            if !snapshots.iter().any(|s| s.id == snapshot_id) {
                return Err(Error::SnapshotNotFound(format!(
                    "{snapshot_id} is not part of run {run_id}"
                )));
            }
        }

        let archive_path = self.archive_path(run_id, snapshot_id);
        let mount = mount_root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)
                .map_err(|e| Error::SnapshotNotFound(format!("{}: {e}", archive_path.display())))?;
            let mut reader = std::io::BufReader::new(file);
            let compression = {
                use std::io::BufRead;
                Compression::detect(reader.fill_buf()?)
            };
            archiver::extract_archive(reader, &mount, compression)
        })
        .await
        .map_err(|e| workspace_error("attach task failed", e))??;

        debug!(run_id = %run_id, snapshot_id = %snapshot_id, mount = %mount_root.display(), "Workspace attached");
        Ok(())
    }

    async fn snapshots(&self, run_id: RunId) -> Result<Vec<SnapshotInfo>> {
        let mut manifests = self.manifests.lock().await;
        Ok(self.run_snapshots(&mut manifests, run_id).await?.clone())
    }

    async fn discard(&self, run_id: RunId) -> Result<()> {
        self.manifests.lock().await.remove(&run_id);
        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(run_id = %run_id, "Workspace namespace discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(workspace_error("failed to discard run namespace", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("target")).unwrap();
        std::fs::write(dir.join("target/app"), b"built").unwrap();
        std::fs::write(dir.join("Cargo.toml"), b"[package]").unwrap();
    }

    #[tokio::test]
    async fn test_persist_and_attach_private_copy() {
        let root = tempfile::tempdir().unwrap();
        let producer = tempfile::tempdir().unwrap();
        let consumer = tempfile::tempdir().unwrap();
        populate(producer.path());

        let store = FilesystemWorkspaceStore::new(root.path());
        let run = RunId::new();
        let snapshot = store
            .persist(run, &JobName::new("fetch"), producer.path(), &[".".to_string()])
            .await
            .unwrap();
        assert!(snapshot.size_bytes > 0);

        store.attach(run, snapshot.id, consumer.path()).await.unwrap();
        assert_eq!(std::fs::read(consumer.path().join("target/app")).unwrap(), b"built");

        // Consumer edits do not leak into the snapshot.
        std::fs::write(consumer.path().join("target/app"), b"mutated").unwrap();
        let second = tempfile::tempdir().unwrap();
        store.attach(run, snapshot.id, second.path()).await.unwrap();
        assert_eq!(std::fs::read(second.path().join("target/app")).unwrap(), b"built");
    }

    #[tokio::test]
    async fn test_snapshots_are_run_scoped() {
        let root = tempfile::tempdir().unwrap();
        let producer = tempfile::tempdir().unwrap();
        let consumer = tempfile::tempdir().unwrap();
        populate(producer.path());

        let store = FilesystemWorkspaceStore::new(root.path());
        let run_a = RunId::new();
        let run_b = RunId::new();
        let snapshot = store
            .persist(run_a, &JobName::new("fetch"), producer.path(), &["target".to_string()])
            .await
            .unwrap();

        let err = store.attach(run_b, snapshot.id, consumer.path()).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound(_)));
        assert!(store.snapshots(run_b).await.unwrap().is_empty());
        assert_eq!(store.snapshots(run_a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discard_removes_namespace() {
        let root = tempfile::tempdir().unwrap();
        let producer = tempfile::tempdir().unwrap();
        populate(producer.path());

        let store = FilesystemWorkspaceStore::new(root.path());
        let run = RunId::new();
        store
            .persist(run, &JobName::new("fetch"), producer.path(), &["Cargo.toml".to_string()])
            .await
            .unwrap();
        store.discard(run).await.unwrap();

        assert!(!root.path().join(run.to_string()).exists());
        assert!(store.snapshots(run).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_missing_paths_fails() {
        let root = tempfile::tempdir().unwrap();
        let producer = tempfile::tempdir().unwrap();
        let store = FilesystemWorkspaceStore::new(root.path());

        let err = store
            .persist(RunId::new(), &JobName::new("fetch"), producer.path(), &["dist".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_workspace());
    }
}
