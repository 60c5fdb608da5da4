//! Object storage abstraction (§4.7 upload step): multipart upload of an
//! encoded export artifact, plus presigned download URL issuance.

use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads `body` under `key`, using multipart upload in `part_size`
    /// chunks with up to `max_concurrent_parts` in flight when the backend
    /// supports it (§4.7 step 5: 5 MB parts, 4 concurrent).
    async fn put_multipart(
        &self,
        key: &str,
        body: Vec<u8>,
        part_size: usize,
        max_concurrent_parts: usize,
    ) -> Result<(), StorageError>;

    /// Issues a time-limited download URL for `key`, valid until `expires_at`.
    async fn presign_download(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, StorageError>;

    async fn object_size(&self, key: &str) -> Result<u64, StorageError>;

    /// Downloads an object in full — used to pull an uploaded import file
    /// into memory before decoding (§4.4: decoding itself is bounded-memory,
    /// but the transfer off object storage is not this trait's concern).
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// In-process backend for tests: stores bodies in memory, "presigns" a
/// deterministic URL embedding the key and expiry.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    pub struct InMemoryObjectStorage {
        objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl InMemoryObjectStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.objects.lock().await.get(key).cloned()
        }
    }

    #[async_trait]
    impl ObjectStorage for InMemoryObjectStorage {
        async fn put_multipart(
            &self,
            key: &str,
            body: Vec<u8>,
            _part_size: usize,
            _max_concurrent_parts: usize,
        ) -> Result<(), StorageError> {
            self.objects.lock().await.insert(key.to_string(), body);
            Ok(())
        }

        async fn presign_download(
            &self,
            key: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<String, StorageError> {
            if !self.objects.lock().await.contains_key(key) {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Ok(format!("https://objects.test/{key}?expires={}", expires_at.timestamp()))
        }

        async fn object_size(&self, key: &str) -> Result<u64, StorageError> {
            self.objects
                .lock()
                .await
                .get(key)
                .map(|b| b.len() as u64)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .lock()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        }
    }
}

/// `aws-sdk-s3`-backed production implementation, feature-gated the way the
/// S3 object-storage repo in the retrieval pack gates its own `s3` feature.
#[cfg(feature = "s3")]
pub mod s3 {
    use super::*;
    use aws_sdk_s3::config::Region;
    use aws_sdk_s3::presigning::PresigningConfig;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client;
    use futures::stream::{FuturesUnordered, StreamExt};
    use std::time::Duration as StdDuration;

    pub struct S3ObjectStorage {
        client: Client,
        bucket: String,
    }

    impl S3ObjectStorage {
        pub async fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
            let config = aws_config::from_env().region(Region::new(region.into())).load().await;
            Self {
                client: Client::new(&config),
                bucket: bucket.into(),
            }
        }
    }

    #[async_trait]
    impl ObjectStorage for S3ObjectStorage {
        async fn put_multipart(
            &self,
            key: &str,
            body: Vec<u8>,
            part_size: usize,
            max_concurrent_parts: usize,
        ) -> Result<(), StorageError> {
            if body.len() <= part_size {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                return Ok(());
            }

            let upload = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let upload_id = upload.upload_id().ok_or_else(|| {
                StorageError::Backend("create_multipart_upload returned no upload id".into())
            })?;

            let parts: Vec<(i32, Vec<u8>)> = body
                .chunks(part_size)
                .enumerate()
                .map(|(idx, chunk)| (idx as i32 + 1, chunk.to_vec()))
                .collect();

            let mut in_flight = FuturesUnordered::new();
            let mut completed = Vec::with_capacity(parts.len());
            let mut iter = parts.into_iter();

            for _ in 0..max_concurrent_parts {
                if let Some((part_number, chunk)) = iter.next() {
                    in_flight.push(self.upload_part(key, upload_id, part_number, chunk));
                }
            }

            while let Some(result) = in_flight.next().await {
                completed.push(result.map_err(|e| StorageError::Backend(e.to_string()))?);
                if let Some((part_number, chunk)) = iter.next() {
                    in_flight.push(self.upload_part(key, upload_id, part_number, chunk));
                }
            }

            completed.sort_by_key(|(part_number, _)| *part_number);
            let completed_parts = completed
                .into_iter()
                .map(|(part_number, e_tag)| {
                    aws_sdk_s3::types::CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(e_tag)
                        .build()
                })
                .collect();

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(
                    aws_sdk_s3::types::CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            Ok(())
        }

        async fn presign_download(
            &self,
            key: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<String, StorageError> {
            let ttl = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(StdDuration::from_secs(0));
            let presign_config = PresigningConfig::expires_in(ttl)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let presigned = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(presign_config)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(presigned.uri().to_string())
        }

        async fn object_size(&self, key: &str) -> Result<u64, StorageError> {
            let head = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(head.content_length().unwrap_or(0) as u64)
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let bytes = object
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(bytes.into_bytes().to_vec())
        }
    }

    impl S3ObjectStorage {
        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            chunk: Vec<u8>,
        ) -> Result<(i32, String), aws_sdk_s3::Error> {
            let result = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await?;
            Ok((part_number, result.e_tag().unwrap_or_default().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryObjectStorage;
    use super::*;

    #[tokio::test]
    async fn round_trips_an_object_through_memory_backend() {
        let storage = InMemoryObjectStorage::new();
        storage
            .put_multipart("exports/job-1/export.csv", b"a,b\n1,2\n".to_vec(), 5, 2)
            .await
            .unwrap();

        assert_eq!(storage.object_size("exports/job-1/export.csv").await.unwrap(), 8);
        let url = storage
            .presign_download("exports/job-1/export.csv", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(url.contains("exports/job-1/export.csv"));
    }

    #[tokio::test]
    async fn presign_unknown_key_fails() {
        let storage = InMemoryObjectStorage::new();
        let err = storage
            .presign_download("missing", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
