//! Cloud collaborator adapters.
//!
//! The VM provider and the object store are consumed through traits so the
//! control loops never touch a vendor SDK directly. The `fakes` module ships
//! in-process implementations used by tests and `--dev` deployments.

use anyhow::Result;
use async_trait::async_trait;

use ariana_types::{CoreError, MachineId};

//─────────────────────────────
//  Machine provider
//─────────────────────────────

/// A VM the provider just created.
#[derive(Debug, Clone)]
pub struct ProvisionedMachine {
    /// Provider-assigned machine id.
    pub id: MachineId,
    /// VM address.
    pub ipv4: String,
    /// Base URL of the worker API on the VM.
    pub url: String,
    /// Secret established at provisioning; the wire cipher derives from it.
    pub agent_secret: String,
}

/// Create/destroy/image VMs.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Boot a fresh VM running the worker image.
    async fn create_machine(&self) -> Result<ProvisionedMachine, CoreError>;
    /// Destroy a VM. Idempotent.
    async fn destroy_machine(&self, id: &MachineId) -> Result<(), CoreError>;
    /// Produce a filesystem image of the VM.
    async fn capture_image(&self, id: &MachineId) -> Result<Vec<u8>, CoreError>;
}

//─────────────────────────────
//  Blob store
//─────────────────────────────

/// Object store reached exclusively through presigned URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Presigned PUT URL for a key.
    async fn presign_upload(&self, key: &str) -> Result<String>;
    /// Presigned GET URL for a key.
    async fn presign_download(&self, key: &str) -> Result<String>;
    /// Keys under a prefix in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Delete one object. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Upload bytes through a presigned URL.
    async fn put(&self, presigned_url: &str, bytes: Vec<u8>) -> Result<()>;
}

//─────────────────────────────
//  Fakes
//─────────────────────────────

/// In-process fakes for tests and `--dev` deployments.
pub mod fakes {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Counter-backed machine provider; flip `fail_creates` to simulate a
    /// provider outage.
    #[derive(Default)]
    pub struct FakeMachineProvider {
        counter: AtomicU64,
        /// When true every `create_machine` fails.
        pub fail_creates: AtomicBool,
        images: DashMap<MachineId, Vec<u8>>,
    }

    impl FakeMachineProvider {
        /// Fresh provider with no machines.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed the image a machine will report on capture.
        pub fn seed_image(&self, id: MachineId, image: Vec<u8>) {
            self.images.insert(id, image);
        }
    }

    #[async_trait]
    impl MachineProvider for FakeMachineProvider {
        async fn create_machine(&self) -> Result<ProvisionedMachine, CoreError> {
            if self.fail_creates.load(Ordering::Relaxed) {
                return Err(CoreError::ProvisioningFailed(
                    "provider refused the request".to_string(),
                ));
            }
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            let id = MachineId(format!("machine-{n}"));
            self.images.insert(id.clone(), vec![0u8; 64]);
            Ok(ProvisionedMachine {
                id: id.clone(),
                ipv4: format!("10.0.0.{n}"),
                url: format!("http://10.0.0.{n}:8420"),
                agent_secret: format!("secret-{n}"),
            })
        }

        async fn destroy_machine(&self, id: &MachineId) -> Result<(), CoreError> {
            self.images.remove(id);
            Ok(())
        }

        async fn capture_image(&self, id: &MachineId) -> Result<Vec<u8>, CoreError> {
            self.images
                .get(id)
                .map(|image| image.clone())
                .ok_or_else(|| {
                    CoreError::ProvisioningFailed(format!("machine {id} does not exist"))
                })
        }
    }

    /// Map-backed blob store; presigned URLs carry the key in their path.
    #[derive(Default)]
    pub struct FakeBlobStore {
        objects: DashMap<String, Vec<u8>>,
    }

    impl FakeBlobStore {
        /// Fresh empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// True when a blob exists at the key.
        pub fn contains(&self, key: &str) -> bool {
            self.objects.contains_key(key)
        }

        fn key_of(url: &str) -> &str {
            url.strip_prefix("https://blobs.local/")
                .map(|rest| rest.split('?').next().unwrap_or(rest))
                .unwrap_or(url)
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn presign_upload(&self, key: &str) -> Result<String> {
            Ok(format!("https://blobs.local/{key}?sig=up"))
        }

        async fn presign_download(&self, key: &str) -> Result<String> {
            Ok(format!("https://blobs.local/{key}?sig=down"))
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let mut keys: Vec<String> = self
                .objects
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect();
            keys.sort();
            Ok(keys)
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.remove(key);
            Ok(())
        }

        async fn put(&self, presigned_url: &str, bytes: Vec<u8>) -> Result<()> {
            self.objects
                .insert(Self::key_of(presigned_url).to_string(), bytes);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn fake_blob_store_lists_in_lexicographic_order() {
            let store = FakeBlobStore::new();
            for key in ["s/m1/a/000001.part", "s/m1/a/000000.part", "s/m2/b.img"] {
                let url = store.presign_upload(key).await.unwrap();
                store.put(&url, vec![1]).await.unwrap();
            }
            let keys = store.list("s/m1/a/").await.unwrap();
            assert_eq!(keys, vec!["s/m1/a/000000.part", "s/m1/a/000001.part"]);
        }

        #[tokio::test]
        async fn fake_provider_outage() {
            let provider = FakeMachineProvider::new();
            provider.fail_creates.store(true, Ordering::Relaxed);
            assert!(matches!(
                provider.create_machine().await,
                Err(CoreError::ProvisioningFailed(_))
            ));
        }
    }
}
