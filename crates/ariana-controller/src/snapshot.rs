//! R2-backed machine snapshots.
//!
//! Capture produces a filesystem image via the machine provider and uploads
//! it through presigned URLs, chunked for large images (key prefix ending in
//! `/`, parts named `000000.part`, `000001.part`, …; lexicographic listing
//! order equals restore order). Carryover writes a second row on an existing
//! blob so a freshly restored agent is immediately forkable. The garbage
//! collector deletes blobs only when the last row referencing their key has
//! expired.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use ariana_store::SnapshotRepository;
use ariana_types::{
    CoreError, MachineId, MachineSnapshot, SnapshotId, SnapshotSource, SNAPSHOT_RETENTION_DAYS,
};

use crate::providers::{BlobStore, MachineProvider};

/// Images larger than this are split into fixed-size chunks.
pub const SNAPSHOT_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Chunked image snapshots with carryover and retention.
pub struct SnapshotService {
    snapshots: Arc<dyn SnapshotRepository>,
    blobs: Arc<dyn BlobStore>,
    provider: Arc<dyn MachineProvider>,
    chunk_bytes: usize,
}

impl SnapshotService {
    /// Service with the default chunk size.
    pub fn new(
        snapshots: Arc<dyn SnapshotRepository>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn MachineProvider>,
    ) -> Self {
        Self::with_chunk_bytes(snapshots, blobs, provider, SNAPSHOT_CHUNK_BYTES)
    }

    /// Service with an explicit chunk size (tests shrink it).
    pub fn with_chunk_bytes(
        snapshots: Arc<dyn SnapshotRepository>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn MachineProvider>,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            snapshots,
            blobs,
            provider,
            chunk_bytes,
        }
    }

    /// Capture the machine's filesystem image and record one snapshot row.
    pub async fn capture(&self, machine_id: &MachineId) -> Result<MachineSnapshot, CoreError> {
        let image = self.provider.capture_image(machine_id).await?;
        let snapshot_id = SnapshotId(Uuid::new_v4().to_string());
        let size_bytes = image.len() as u64;

        let r2_key = if image.len() > self.chunk_bytes {
            let prefix = format!("snapshots/{machine_id}/{snapshot_id}/");
            for (index, chunk) in image.chunks(self.chunk_bytes).enumerate() {
                let key = format!("{prefix}{index:06}.part");
                let url = self
                    .blobs
                    .presign_upload(&key)
                    .await
                    .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
                self.blobs
                    .put(&url, chunk.to_vec())
                    .await
                    .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
            }
            prefix
        } else {
            let key = format!("snapshots/{machine_id}/{snapshot_id}.img");
            let url = self
                .blobs
                .presign_upload(&key)
                .await
                .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
            self.blobs
                .put(&url, image)
                .await
                .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
            key
        };

        let snapshot = MachineSnapshot {
            id: snapshot_id,
            machine_id: machine_id.clone(),
            r2_key,
            size_bytes,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(SNAPSHOT_RETENTION_DAYS),
            source: SnapshotSource::Captured,
        };
        self.snapshots
            .insert_captured(snapshot.clone())
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
        info!(
            machine = %machine_id,
            snapshot = %snapshot.id,
            size_bytes,
            chunked = snapshot.is_chunked(),
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Most recent snapshot row for a machine.
    pub async fn find_latest(
        &self,
        machine_id: &MachineId,
    ) -> Result<Option<MachineSnapshot>, CoreError> {
        self.snapshots
            .find_latest_for_machine(machine_id)
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))
    }

    /// Presigned download URLs in restore order: one per chunk for a chunked
    /// key, one for the whole blob otherwise.
    pub async fn prepare_restore(
        &self,
        snapshot: &MachineSnapshot,
    ) -> Result<Vec<String>, CoreError> {
        if snapshot.is_chunked() {
            let keys = self
                .blobs
                .list(&snapshot.r2_key)
                .await
                .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
            if keys.is_empty() {
                return Err(CoreError::SnapshotMissing {
                    machine_id: snapshot.machine_id.0.clone(),
                });
            }
            let mut urls = Vec::with_capacity(keys.len());
            for key in keys {
                urls.push(
                    self.blobs
                        .presign_download(&key)
                        .await
                        .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?,
                );
            }
            Ok(urls)
        } else {
            Ok(vec![self
                .blobs
                .presign_download(&snapshot.r2_key)
                .await
                .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?])
        }
    }

    /// Write a carryover row on the target machine referencing an existing
    /// blob. Never duplicates the blob; ref-counting delays deletion until
    /// the last row expires.
    pub async fn create_carried_over_snapshot(
        &self,
        target_machine_id: &MachineId,
        r2_key: &str,
        size_bytes: u64,
    ) -> Result<MachineSnapshot, CoreError> {
        let snapshot = MachineSnapshot {
            id: SnapshotId(Uuid::new_v4().to_string()),
            machine_id: target_machine_id.clone(),
            r2_key: r2_key.to_string(),
            size_bytes,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(SNAPSHOT_RETENTION_DAYS),
            source: SnapshotSource::CarriedOver,
        };
        self.snapshots
            .insert_carryover(snapshot.clone())
            .await
            .map_err(|e| CoreError::SnapshotRestoreFailed(e.to_string()))?;
        info!(
            machine = %target_machine_id,
            key = %r2_key,
            "carryover snapshot recorded"
        );
        Ok(snapshot)
    }

    /// Delete expired rows; a blob falls only with its last referencing row.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self.snapshots.list_expired(now).await?;
        let mut deleted = 0;
        for snapshot in expired {
            let references = self.snapshots.count_rows_for_key(&snapshot.r2_key).await?;
            if references <= 1 {
                if snapshot.is_chunked() {
                    for key in self.blobs.list(&snapshot.r2_key).await? {
                        self.blobs.delete(&key).await?;
                    }
                } else {
                    self.blobs.delete(&snapshot.r2_key).await?;
                }
            } else {
                warn!(
                    key = %snapshot.r2_key,
                    references,
                    "expired row leaves blob alive for remaining references"
                );
            }
            self.snapshots.delete(&snapshot.id).await?;
            deleted += 1;
        }
        if deleted > 0 {
            info!(deleted, "snapshot garbage collected");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fakes::{FakeBlobStore, FakeMachineProvider};
    use ariana_store::{MemoryStore, Repositories};

    struct Fixture {
        service: SnapshotService,
        blobs: Arc<FakeBlobStore>,
        provider: Arc<FakeMachineProvider>,
        repos: Repositories,
    }

    fn fixture(chunk_bytes: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories {
            agents: store.clone(),
            prompts: store.clone(),
            messages: store.clone(),
            commits: store.clone(),
            machines: store.clone(),
            snapshots: store.clone(),
            usage: store,
        };
        let blobs = Arc::new(FakeBlobStore::new());
        let provider = Arc::new(FakeMachineProvider::new());
        let service = SnapshotService::with_chunk_bytes(
            repos.snapshots.clone(),
            blobs.clone(),
            provider.clone(),
            chunk_bytes,
        );
        Fixture {
            service,
            blobs,
            provider,
            repos,
        }
    }

    #[tokio::test]
    async fn small_image_uploads_as_single_object() {
        let f = fixture(1024);
        let machine = MachineId("m1".into());
        f.provider.seed_image(machine.clone(), vec![7u8; 100]);

        let snapshot = f.service.capture(&machine).await.unwrap();
        assert!(!snapshot.is_chunked());
        assert!(snapshot.r2_key.starts_with("snapshots/m1/"));
        assert!(snapshot.r2_key.ends_with(".img"));
        assert!(f.blobs.contains(&snapshot.r2_key));

        let urls = f.service.prepare_restore(&snapshot).await.unwrap();
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn large_image_chunks_in_restore_order() {
        let f = fixture(64);
        let machine = MachineId("m1".into());
        f.provider.seed_image(machine.clone(), vec![7u8; 200]);

        let snapshot = f.service.capture(&machine).await.unwrap();
        assert!(snapshot.is_chunked());

        let urls = f.service.prepare_restore(&snapshot).await.unwrap();
        // 200 bytes at 64-byte chunks: four parts.
        assert_eq!(urls.len(), 4);
        assert!(urls[0].contains("000000.part"));
        assert!(urls[3].contains("000003.part"));
    }

    #[tokio::test]
    async fn carryover_shares_the_blob_and_gc_respects_references() {
        let f = fixture(1024);
        let machine = MachineId("m1".into());
        f.provider.seed_image(machine.clone(), vec![1u8; 10]);
        let captured = f.service.capture(&machine).await.unwrap();

        let carried = f
            .service
            .create_carried_over_snapshot(&MachineId("m2".into()), &captured.r2_key, 10)
            .await
            .unwrap();
        assert_eq!(carried.r2_key, captured.r2_key);
        assert_eq!(carried.source, SnapshotSource::CarriedOver);

        // Expire only the captured row; the blob must survive the sweep.
        let mut expired = captured.clone();
        expired.expires_at = Utc::now() - Duration::days(1);
        f.repos.snapshots.delete(&captured.id).await.unwrap();
        f.repos.snapshots.insert_captured(expired).await.unwrap();

        let deleted = f.service.collect_garbage().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(f.blobs.contains(&captured.r2_key));
    }

    #[tokio::test]
    async fn gc_deletes_blob_with_last_reference() {
        let f = fixture(1024);
        let machine = MachineId("m1".into());
        f.provider.seed_image(machine.clone(), vec![1u8; 10]);
        let captured = f.service.capture(&machine).await.unwrap();

        let mut expired = captured.clone();
        expired.expires_at = Utc::now() - Duration::days(1);
        f.repos.snapshots.delete(&captured.id).await.unwrap();
        f.repos.snapshots.insert_captured(expired).await.unwrap();

        f.service.collect_garbage().await.unwrap();
        assert!(!f.blobs.contains(&captured.r2_key));
    }
}
