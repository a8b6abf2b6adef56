use std::env;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use tracing::{info, warn};

use crate::catalog::{self, AcquisitionTarget};
use crate::validate::ValidatedImage;

/// Durable artifact: where the normalized image lives and which catalog
/// item it belongs to.
#[derive(Debug, Clone)]
pub struct PersistedImageRecord {
    pub key: String,
    pub public_url: String,
    pub item_id: i64,
}

/// Persistence seam for the driver. The live implementation is
/// `CatalogPersister`; tests substitute a mock.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn persist(
        &self,
        target: &AcquisitionTarget,
        image: &ValidatedImage,
    ) -> Result<PersistedImageRecord>;
}

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

pub fn slug(s: &str) -> String {
    SLUG_RE
        .replace_all(&s.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Deterministic storage key: `{brand}/{model}-{category}-{hash8}.jpg`.
/// The disambiguator is a SHA-256 prefix of the normalized bytes, so
/// identical bytes re-upload to the identical key and re-runs stay
/// idempotent, while changed bytes get a fresh key.
pub fn storage_key(target: &AcquisitionTarget, bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!(
        "{}/{}-{}-{}.jpg",
        slug(&target.brand),
        slug(&target.model),
        slug(&target.category),
        &digest[..8]
    )
}

/// Object key within our bucket for a previously persisted URL, `None`
/// when the URL points elsewhere.
pub fn key_in_bucket(url: &str, endpoint: &str, bucket: &str) -> Option<String> {
    url.strip_prefix(&format!("{}/{}/", endpoint, bucket))
        .map(|k| k.to_string())
}

#[derive(Clone)]
pub struct StorageManager {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl StorageManager {
    pub async fn new() -> Result<Self> {
        let endpoint =
            env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".to_string());
        let access_key = env::var("MINIO_ROOT_USER").unwrap_or_else(|_| "minio_user".to_string());
        let secret_key =
            env::var("MINIO_ROOT_PASSWORD").unwrap_or_else(|_| "minio_password".to_string());
        let bucket = env::var("MINIO_BUCKET").unwrap_or_else(|_| "catalog-images".to_string());

        let region_provider =
            RegionProviderChain::default_provider().or_else(Region::new("us-east-1"));
        let config = aws_config::from_env()
            .region(region_provider)
            .endpoint_url(&endpoint)
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "static"))
            .load()
            .await;

        let client_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(client_config);

        // bounded bucket init retry, transient connect errors included
        let mut attempts = 0;
        loop {
            match client.head_bucket().bucket(&bucket).send().await {
                Ok(_) => {
                    println!("✅ Bucket '{}' exists", bucket);
                    break;
                }
                Err(e) => {
                    let is_not_found = e.into_service_error().is_not_found();
                    if is_not_found {
                        println!("⚠️ Bucket '{}' not found, creating...", bucket);
                        match client.create_bucket().bucket(&bucket).send().await {
                            Ok(_) => {
                                println!("✅ Created bucket '{}'", bucket);
                                break;
                            }
                            Err(create_err) => {
                                eprintln!("🔥 Failed to create bucket: {}", create_err);
                            }
                        }
                    }
                    attempts += 1;
                    if attempts >= 10 {
                        return Err(anyhow::anyhow!(
                            "failed to reach blob storage after {} attempts",
                            attempts
                        ));
                    }
                    println!(
                        "⚠️ Storage connect failed (attempt {}/10), retrying in 2s...",
                        attempts
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                }
            }
        }

        Ok(Self {
            client,
            bucket,
            endpoint,
        })
    }

    /// Overwrite-semantics upload: same key, same object, no versioning.
    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await?;
        Ok(self.public_url(key))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    pub fn owned_key(&self, url: &str) -> Option<String> {
        key_in_bucket(url, &self.endpoint, &self.bucket)
    }
}

/// Live persistence: upload to blob storage, drop the superseded object,
/// then repoint the catalog record.
#[derive(Clone)]
pub struct CatalogPersister {
    storage: StorageManager,
    pool: PgPool,
}

impl CatalogPersister {
    pub fn new(storage: StorageManager, pool: PgPool) -> Self {
        Self { storage, pool }
    }
}

#[async_trait]
impl ImageSink for CatalogPersister {
    async fn persist(
        &self,
        target: &AcquisitionTarget,
        image: &ValidatedImage,
    ) -> Result<PersistedImageRecord> {
        let key = storage_key(target, &image.bytes);

        // Ordering is load-bearing: upload first, repoint the catalog last.
        // A crash in between leaves an orphaned object, never a catalog
        // reference to a missing one.
        let public_url = self
            .storage
            .put(&key, image.bytes.clone(), image.content_type)
            .await?;

        if let Some(old_url) = &target.existing_image_url {
            if let Some(old_key) = self.storage.owned_key(old_url) {
                if old_key != key {
                    if let Err(e) = self.storage.delete(&old_key).await {
                        warn!(key = %old_key, "failed to delete superseded image: {}", e);
                    }
                }
            }
        }

        catalog::update_image_reference(&self.pool, target.item_id, &public_url).await?;

        info!(
            item = target.item_id,
            key = %key,
            "image persisted and catalog updated"
        );

        Ok(PersistedImageRecord {
            key,
            public_url,
            item_id: target.item_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> AcquisitionTarget {
        AcquisitionTarget {
            item_id: 1,
            brand: "Acme".into(),
            model: "X1".into(),
            category: "driver".into(),
            existing_image_url: None,
        }
    }

    #[test]
    fn slug_normalizes_case_and_separators() {
        assert_eq!(slug("Acme"), "acme");
        assert_eq!(slug("Big Bertha B-21"), "big-bertha-b-21");
        assert_eq!(slug("  X1 / Pro  "), "x1-pro");
    }

    #[test]
    fn storage_key_shape_matches_brand_model_prefix() {
        let key = storage_key(&target(), b"image-bytes");
        assert!(key.starts_with("acme/x1-driver-"), "got {}", key);
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn identical_bytes_produce_identical_keys() {
        let a = storage_key(&target(), b"same-bytes");
        let b = storage_key(&target(), b"same-bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn changed_bytes_produce_a_fresh_key() {
        let a = storage_key(&target(), b"old-bytes");
        let b = storage_key(&target(), b"new-bytes");
        assert_ne!(a, b);
    }

    #[test]
    fn owned_keys_are_recovered_from_public_urls() {
        let url = "http://localhost:9000/catalog-images/acme/x1-driver-abcd1234.jpg";
        assert_eq!(
            key_in_bucket(url, "http://localhost:9000", "catalog-images").unwrap(),
            "acme/x1-driver-abcd1234.jpg"
        );
        assert!(key_in_bucket(url, "http://localhost:9000", "other-bucket").is_none());
    }
}
