//! Durable ciphertext storage.
//!
//! The cache drains finished uploads here and refills evicted files from
//! here. Objects are addressed as `<bucket>/<id>`, where `bucket` is the
//! cache partition and `id` the content connector.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use opendal::Operator;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use odrive_core::config::{StorageBackend, StorageConfig};

/// Ranged reads are issued in pieces of this size so a large object never
/// sits in memory all at once.
const FETCH_CHUNK: u64 = 16 * 1024 * 1024;
const PUT_CHUNK: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<opendal::Error> for BlobError {
    fn from(e: opendal::Error) -> Self {
        if e.kind() == opendal::ErrorKind::NotFound {
            BlobError::NotFound(e.to_string())
        } else {
            BlobError::Storage(e.to_string())
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `size` bytes from `reader` to `<bucket>/<id>`.
    async fn put(
        &self,
        bucket: &str,
        id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> Result<(), BlobError>;

    /// Stream `<bucket>/<id>` into `writer`, returning the byte count.
    async fn get(
        &self,
        bucket: &str,
        id: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, BlobError>;

    /// False when the store keeps nothing; the cache must then never evict.
    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

fn blob_path(bucket: &str, id: &str) -> String {
    if bucket.is_empty() {
        id.to_string()
    } else {
        format!("{bucket}/{id}")
    }
}

/// BlobStore over any OpenDAL operator (S3, fs, memory).
#[derive(Clone)]
pub struct OpendalBlobStore {
    op: Operator,
    name: String,
}

impl OpendalBlobStore {
    pub fn new(op: Operator, name: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    async fn put(
        &self,
        bucket: &str,
        id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> Result<(), BlobError> {
        let path = blob_path(bucket, id);
        let mut writer = self.op.writer(&path).await?;
        let mut sent = 0u64;
        let mut buf = vec![0u8; PUT_CHUNK];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.write(buf[..n].to_vec()).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
            sent += n as u64;
        }

        if sent != size {
            let _ = writer.abort().await;
            return Err(BlobError::Storage(format!(
                "short upload for {path}: sent {sent} of {size} bytes"
            )));
        }
        writer.close().await?;
        debug!(path = %path, bytes = sent, "blob stored");
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        id: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, BlobError> {
        let path = blob_path(bucket, id);
        let total = self.op.stat(&path).await?.content_length();
        let mut offset = 0u64;

        while offset < total {
            let end = (offset + FETCH_CHUNK).min(total);
            let chunk = self.op.read_with(&path).range(offset..end).await?;
            writer.write_all(&chunk.to_bytes()).await?;
            offset = end;
        }
        writer.flush().await?;
        debug!(path = %path, bytes = total, "blob fetched");
        Ok(total)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A store that keeps nothing. Used when the local cache is the only copy.
#[derive(Debug, Default, Clone)]
pub struct NullBlobStore;

#[async_trait]
impl BlobStore for NullBlobStore {
    async fn put(
        &self,
        _bucket: &str,
        _id: &str,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
        _size: u64,
    ) -> Result<(), BlobError> {
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        id: &str,
        _writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, BlobError> {
        Err(BlobError::NotFound(blob_path(bucket, id)))
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Open the configured backend. S3 credentials come from the caller.
pub fn open_blob_store(
    storage: &StorageConfig,
    credentials: Option<(&str, &str)>,
) -> anyhow::Result<(Arc<dyn BlobStore>, Option<Operator>)> {
    match storage.backend {
        StorageBackend::S3 => {
            let (key, secret) = credentials.context("S3 backend requires credentials")?;
            let op = crate::operator::build_from_core_config(storage, key, secret)?;
            Ok((Arc::new(OpendalBlobStore::new(op.clone(), "s3")), Some(op)))
        }
        StorageBackend::Fs => {
            let op = crate::operator::build_fs_operator(&storage.root)?;
            Ok((Arc::new(OpendalBlobStore::new(op.clone(), "fs")), Some(op)))
        }
        StorageBackend::Memory => {
            let op = crate::operator::build_memory_operator()?;
            Ok((Arc::new(OpendalBlobStore::new(op.clone(), "memory")), Some(op)))
        }
        StorageBackend::Null => Ok((Arc::new(NullBlobStore), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> OpendalBlobStore {
        OpendalBlobStore::new(crate::operator::build_memory_operator().unwrap(), "memory")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = memory_store();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let mut reader = data.as_slice();
        store.put("cache", "abc", &mut reader, data.len() as u64).await.unwrap();

        let mut out = Vec::new();
        let n = store.get("cache", "abc", &mut out).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = memory_store();
        let mut out = Vec::new();
        let err = store.get("cache", "missing", &mut out).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_short_upload_rejected() {
        let store = memory_store();
        let mut reader: &[u8] = b"four";
        let err = store.put("cache", "short", &mut reader, 10).await.unwrap_err();
        assert!(matches!(err, BlobError::Storage(_)));
    }

    #[tokio::test]
    async fn test_null_store_keeps_nothing() {
        let store = NullBlobStore;
        let mut reader: &[u8] = b"data";
        store.put("cache", "x", &mut reader, 4).await.unwrap();
        let mut out = Vec::new();
        assert!(store.get("cache", "x", &mut out).await.is_err());
        assert!(!store.is_durable());
    }

    #[test]
    fn test_open_null_backend() {
        let cfg = StorageConfig {
            backend: StorageBackend::Null,
            ..Default::default()
        };
        let (store, op) = open_blob_store(&cfg, None).unwrap();
        assert_eq!(store.name(), "null");
        assert!(op.is_none());
    }

    #[test]
    fn test_open_s3_without_credentials_fails() {
        let cfg = StorageConfig::default();
        assert!(open_blob_store(&cfg, None).is_err());
    }
}
