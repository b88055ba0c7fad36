//! S3 chunk storage
//!
//! Stores snapshot chunks as individual objects under `s3://{bucket}/{prefix}/`.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_types::region::Region;
use tether_core::{ChunkStore, TetherError};
use tracing::{debug, info};

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 allows at most this many keys per DeleteObjects call
const DELETE_BATCH: usize = 1000;

/// Create S3 client from environment
pub async fn create_s3_client(region: Option<String>) -> Client {
    let region_str = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
    debug!(region = %region_str, "Creating S3 client");

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region_str))
        .load()
        .await;

    Client::new(&config)
}

fn storage_err(op: &str, key: &str, e: impl std::fmt::Debug) -> TetherError {
    TetherError::Storage(format!("s3 {} {}: {:?}", op, key, e))
}

/// S3 chunk store
pub struct S3ChunkStore {
    client: Client,
    bucket: String,
    /// Key prefix, without trailing slash
    prefix: String,
}

impl S3ChunkStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: "snapshots".to_string(),
        }
    }

    /// Set key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    /// Object key of a chunk key
    fn s3_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Chunk key of an object key
    fn chunk_key<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(object_key)
        } else {
            object_key
                .strip_prefix(self.prefix.as_str())
                .and_then(|k| k.strip_prefix('/'))
        }
    }

    /// Fail early if the bucket is missing or not accessible
    pub async fn check_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| OrchestratorError::S3(aws_sdk_s3::Error::from(e)))?;
        info!(bucket = %self.bucket, prefix = %self.prefix, "S3 chunk store ready");
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for S3ChunkStore {
    async fn put_chunk(&self, key: &str, bytes: Vec<u8>) -> tether_core::traits::Result<()> {
        let object_key = self.s3_key(key);
        let len = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| storage_err("put", &object_key, e))?;

        debug!(bucket = %self.bucket, key = %object_key, bytes = len, "Chunk uploaded");
        Ok(())
    }

    async fn get_chunk(&self, key: &str) -> tether_core::traits::Result<Vec<u8>> {
        let object_key = self.s3_key(key);

        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    return Err(TetherError::NotFound(object_key));
                }
                return Err(storage_err("get", &object_key, service));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| storage_err("read body", &object_key, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn list_keys(&self, prefix: &str) -> tether_core::traits::Result<Vec<String>> {
        let object_prefix = self.s3_key(prefix);
        let mut keys = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&object_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| storage_err("list", &object_prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter_map(|k| self.chunk_key(k))
                    .map(str::to_string),
            );
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_keys(&self, prefix: &str) -> tether_core::traits::Result<()> {
        let keys = self.list_keys(prefix).await?;

        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(self.s3_key(k)).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| storage_err("delete", prefix, e))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| storage_err("delete", prefix, e))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| storage_err("delete", prefix, e))?;
        }

        debug!(bucket = %self.bucket, prefix, deleted = keys.len(), "Chunks deleted");
        Ok(())
    }
}
